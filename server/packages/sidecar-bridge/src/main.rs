fn main() {
    if let Err(err) = sidecar_bridge::cli::run_sidecar_bridge() {
        tracing::error!(error = %err, "sidecar-bridge failed");
        std::process::exit(1);
    }
}
