fn main() {
    let proto_file = "../../proto/shardloader.proto";
    let proto_dir = "../../proto";

    // Rerun if proto file changes
    println!("cargo:rerun-if-changed={}", proto_file);

    // Prefer a system protoc when one is configured
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()
            .expect("No vendored protoc for this platform; set PROTOC");
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .bytes(["."])
        .compile_protos(&[proto_file], &[proto_dir])
        .expect("Failed to compile shardloader.proto");
}
