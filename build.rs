use std::fs::File;
use std::io::{BufWriter, Read, Write};

/// Sources that decide the bytes of an emitted image.
/// A hash map sidecar is only meaningful next to an image built from the same versions of these.
const LAYOUT_SOURCES: &[&str] = &[
    "Cargo.toml",
    "src/vm.rs",
    "src/hash.rs",
    "src/opcode.rs",
    "src/table.rs",
    "src/instruction.rs",
    "src/function.rs",
    "src/section.rs",
    "src/lower.rs",
];

fn main() {
    let mut context = md5::Context::new();
    let mut buf = Vec::with_capacity(4096);
    for &path in LAYOUT_SOURCES {
        println!("cargo:rerun-if-changed={path}");
        buf.clear();
        let mut file = File::open(path).unwrap_or_else(|e| panic!("failed to open {path}: {e}"));
        file.read_to_end(&mut buf).unwrap_or_else(|e| panic!("failed to read {path}: {e}"));
        context.consume(path.as_bytes());
        context.consume(&buf);
    }
    let fingerprint = u128::from_be_bytes(context.compute().0);

    let out_dir = std::env::var("OUT_DIR").expect("cargo always sets OUT_DIR for build scripts");
    let mut meta = BufWriter::new(File::create(format!("{out_dir}/meta.rs")).expect("failed to create meta.rs"));
    writeln!(meta, "/// Fingerprint of the sources that determine the emitted image layout.").unwrap();
    writeln!(meta, "pub const FINGERPRINT: u128 = 0x{fingerprint:0>32x}u128;").unwrap();
}
