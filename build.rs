use std::env;

/// Architectures the kernel table is generated for when no override is given.
const DEFAULT_OFFLOAD_ARCHS: &str = "gfx90a;gfx942";

/// Architectures the flash kernels have instances for.
const KNOWN_ARCHS: &[&str] = &["gfx90a", "gfx942"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=ROCFLASH_OFFLOAD_ARCHS");
    println!("cargo:rerun-if-env-changed=ROCm_ARCH");

    // ROCFLASH_OFFLOAD_ARCHS wins, then the single-arch ROCm_ARCH, then the default list
    let requested = env::var("ROCFLASH_OFFLOAD_ARCHS")
        .or_else(|_| env::var("ROCm_ARCH"))
        .unwrap_or_else(|_| DEFAULT_OFFLOAD_ARCHS.to_string());

    let mut archs: Vec<&str> = Vec::new();
    for arch in requested.split([';', ',']).map(str::trim).filter(|a| !a.is_empty()) {
        if !KNOWN_ARCHS.contains(&arch) {
            println!(
                "cargo:warning=No flash attention kernel instances for {}. Skipping.",
                arch
            );
            continue;
        }
        if !archs.contains(&arch) {
            archs.push(arch);
        }
    }

    if archs.is_empty() {
        println!("cargo:warning=No supported offload arch requested; kernel table will be empty");
    }

    println!("cargo:rustc-env=ROCFLASH_COMPILED_ARCHS={}", archs.join(";"));
}
