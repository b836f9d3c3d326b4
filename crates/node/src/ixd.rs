fn main() {
    if let Err(err) = ixd::run_entry() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
