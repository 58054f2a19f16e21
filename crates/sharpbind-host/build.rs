use std::env;

const DOTNET_VERSION: &str = "net8.0";

fn main() {
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let prefer_coreclr = env::var_os("CARGO_FEATURE_PREFER_CORECLR").is_some();
    let debug = env::var("PROFILE").map(|p| p == "debug").unwrap_or(true);

    // CoreCLR only ships for desktop targets; everything else runs on Mono.
    let desktop = matches!(os.as_str(), "windows" | "macos" | "linux");
    let backend = if prefer_coreclr && desktop { "coreclr" } else { "mono" };

    let platform = match os.as_str() {
        "macos" => "osx",
        other => other,
    };
    let (config, config_raw) = if debug { ("debug", "Debug") } else { ("release", "Release") };

    let library = match (backend, os.as_str()) {
        ("coreclr", "windows") => "coreclr.dll",
        ("coreclr", "macos" | "ios" | "tvos") => "libcoreclr.dylib",
        ("coreclr", _) => "libcoreclr.so",
        (_, "windows") => "monosgen-2.0.dll",
        (_, "macos" | "ios" | "tvos") => "libmonosgen-2.0.dylib",
        _ => "libmonosgen-2.0.so",
    };

    println!("cargo:rustc-check-cfg=cfg(sharpbind_backend, values(\"coreclr\", \"mono\"))");
    println!("cargo:rustc-cfg=sharpbind_backend=\"{backend}\"");
    println!("cargo:rustc-env=SHARPBIND_BACKEND={backend}");
    println!("cargo:rustc-env=SHARPBIND_DOTNET_VERSION={DOTNET_VERSION}");
    println!("cargo:rustc-env=SHARPBIND_NATIVE_LIB_DIR=ThirdParty/{backend}/{platform}.{arch}.{config}");
    println!(
        "cargo:rustc-env=SHARPBIND_MANAGED_LIB_DIR=ThirdParty/runtime/{DOTNET_VERSION}-{platform}-{config_raw}-{arch}"
    );
    println!("cargo:rustc-env=SHARPBIND_RUNTIME_LIB={library}");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=PROFILE");
}
