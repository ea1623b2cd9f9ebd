fn main() {
    // panics render as diagnostics instead of raw backtraces
    miette::set_panic_hook();
    std::process::exit(nx_lib::main());
}
