use std::path::PathBuf;

/// Locate this crate's `proto/` directory via cargo-metadata rather than a
/// relative path, so the build works the same whether invoked from the
/// workspace root or from within this crate.
fn proto_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let metadata = cargo_metadata::MetadataCommand::new().no_deps().exec()?;
    let pkg = metadata
        .packages
        .iter()
        .find(|p| p.name == "dagctl-proto")
        .expect("dagctl-proto package must be present in its own metadata");
    let manifest_dir = pkg
        .manifest_path
        .parent()
        .expect("manifest path has a parent directory");
    Ok(manifest_dir.as_std_path().join("proto"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = proto_dir()?;
    let proto_file = proto_dir.join("coordinator.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_file], &[proto_dir])?;
    println!("cargo:rerun-if-changed=proto/coordinator.proto");
    Ok(())
}
