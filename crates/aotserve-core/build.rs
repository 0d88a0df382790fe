/// Builds the gRPC client and server code for the `aotserve.proto` definition
/// using `tonic-prost-build`.
///
/// The `artifact` field of `CompileResponse` is marked with `.bytes(...)` so
/// compiled artifacts are carried as `Bytes` rather than `Vec<u8>`. Workers
/// hand the artifact buffer to the response without copying it again.
///
/// A file descriptor set is written next to the generated code so the server
/// can register gRPC reflection.
///
/// # Panics
///
/// Panics if code generation fails (for example, when `protoc` is missing).
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("aotserve_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([".aotserve.CompileResponse.artifact"])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/aotserve.proto"], &["proto"])
        .unwrap();
}
