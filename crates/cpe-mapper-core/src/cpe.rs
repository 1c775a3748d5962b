//! CPE 2.3 string helpers
//!
//! A CPE 2.3 name is colon-delimited: `cpe:2.3:a:vendor:product:version:...`.
//! Component 3 is the vendor, 4 the product, 5 the version.

const CPE23_PREFIX: &str = "cpe:2.3:";
const VENDOR_INDEX: usize = 3;
const PRODUCT_INDEX: usize = 4;
const VERSION_INDEX: usize = 5;

/// Loose shape check used to accept or reject oracle output.
pub fn looks_like_cpe(candidate: &str) -> bool {
    candidate.starts_with(CPE23_PREFIX) && candidate.split(':').count() > PRODUCT_INDEX
}

/// Extract the vendor and product components, when present.
pub fn vendor_product(cpe: &str) -> (Option<String>, Option<String>) {
    let parts: Vec<&str> = cpe.split(':').collect();
    let vendor = parts.get(VENDOR_INDEX).map(|s| s.to_string());
    let product = parts.get(PRODUCT_INDEX).map(|s| s.to_string());
    (vendor, product)
}

/// Replace the version component with the version reported by the caller.
/// NVD keyword search returns whatever version it has indexed, not the one
/// actually installed. Returns the input unchanged if it is too short.
pub fn with_version(cpe: &str, version: &str) -> String {
    let mut parts: Vec<&str> = cpe.split(':').collect();
    if parts.len() > VERSION_INDEX {
        parts[VERSION_INDEX] = version;
        parts.join(":")
    } else {
        cpe.to_string()
    }
}
