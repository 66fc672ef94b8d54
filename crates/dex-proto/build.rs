fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only the client side is needed; Dex serves the API
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/api.proto");

    Ok(())
}
