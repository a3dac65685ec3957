/// Builds the gRPC client and server code for `proto/micsrv.proto` using
/// `tonic-prost-build`.
///
/// Besides the Rust bindings, the build writes the encoded file descriptor
/// set to `OUT_DIR/micsrv_descriptor.bin`, which the server hands to
/// `tonic-reflection`.
///
/// Generated code is accessible via:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("micsrv");
/// }
/// ```
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("micsrv_descriptor.bin");

    println!("cargo:rerun-if-changed=proto/micsrv.proto");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/micsrv.proto"],
        &["proto"],
    )?;
    Ok(())
}
