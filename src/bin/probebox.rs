fn main() {
    match probebox::cli::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("probebox: {:#}", e);
            std::process::exit(probebox::cli::EXIT_ERROR);
        }
    }
}
