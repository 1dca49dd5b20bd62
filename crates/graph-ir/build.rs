use protobuf_codegen::Customize;

fn main() {
    // Generate the graph wire-format messages.
    // Enable bytes::Bytes generation for protobuf bytes fields instead of Vec<u8>
    // so tensor payloads stay zero-copy views over the parsed buffer.
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["src/protos"])
        .input("src/protos/graph_ir.proto")
        .cargo_out_dir("graph-ir-protos")
        .customize(Customize::default().tokio_bytes(true))
        .run_from_script();
}
