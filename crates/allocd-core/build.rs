/// Builds the gRPC server and client code for `proto/allocd.proto` using
/// `tonic-prost-build`.
///
/// # Byte Field Optimization
///
/// The rendezvous payload fields are marked with `.bytes(...)` so they decode
/// into `Bytes` instead of `Vec<u8>`. Each payload is fanned out to every peer
/// of a round, and `Bytes` makes that a reference count bump rather than a
/// copy.
///
/// # Output
///
/// Generated code is included by `src/lib.rs` via
/// `tonic::include_proto!("allocd.v1")`, and the encoded descriptor set used by
/// the reflection service is written to `OUT_DIR/allocd_descriptor.bin`.
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single threaded.
        unsafe {
            env::set_var("PROTOC", protoc);
        }
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("allocd_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([
            ".allocd.v1.AllocationAllGatherRequest.data",
            ".allocd.v1.AllocationAllGatherResponse.data",
        ])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/allocd.proto"],
        &["proto"],
    )?;

    println!("cargo:rerun-if-changed=proto/allocd.proto");
    Ok(())
}
