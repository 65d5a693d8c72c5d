fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" and never scans unless the running
    // binary carries an Info.plist with NSBluetoothAlwaysUsageDescription.
    // CLI tools have no bundle, so the plist goes into the Mach-O
    // `__TEXT,__info_plist` section via `-sectcreate`.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host, so cross builds for
    // macOS get the section too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR not set; skipping Info.plist embedding");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
