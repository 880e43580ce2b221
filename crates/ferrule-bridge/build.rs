fn main() {
    // The integration tests resolve libm symbols (`sqrt`) through the
    // process image via `load_self`. Nothing references libm statically,
    // so the linker's default `--as-needed` would drop it; keep it in the
    // test binaries' link set.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "linux" {
        println!("cargo:rustc-link-arg-tests=-Wl,--no-as-needed");
        println!("cargo:rustc-link-arg-tests=-lm");
        println!("cargo:rustc-link-arg-tests=-Wl,--as-needed");
    }
}
