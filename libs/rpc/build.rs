fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .build_transport(false)
        .compile_protos(
            &["proto/manager.proto", "proto/daemon.proto"],
            &["proto"],
        )?;

    Ok(())
}
