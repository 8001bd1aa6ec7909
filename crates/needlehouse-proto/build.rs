fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::configure().compile_protos(
        &[
            "proto/volume.proto",
            "proto/master.proto",
            "proto/raft.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
