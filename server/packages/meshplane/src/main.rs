fn main() {
    if let Err(err) = meshplane::cli::run_meshplane() {
        tracing::error!(error = %err, "meshplane failed");
        std::process::exit(1);
    }
}
