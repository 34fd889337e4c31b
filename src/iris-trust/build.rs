//! Build script for iris-trust.
//!
//! Records the target triple so update checks can report the platform the
//! binary was built for.

fn main() {
    println!(
        "cargo::rustc-env=TARGET={}",
        std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string())
    );
    println!("cargo::rerun-if-env-changed=TARGET");
}
