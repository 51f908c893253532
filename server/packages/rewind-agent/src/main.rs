fn main() {
    if let Err(err) = rewind_agent::cli::run_rewind_agent() {
        tracing::error!(error = %err, "rewind-agent failed");
        std::process::exit(1);
    }
}
