fn main() {
    if let Err(error) = run() {
        libkestrel::error::report_error_and_exit(&error);
    }
}

fn run() -> libkestrel::error::Result {
    let linker = libkestrel::Linker::from_args(std::env::args().skip(1))?;
    linker.run()
}
