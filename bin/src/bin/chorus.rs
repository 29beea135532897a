fn main() {
    std::process::exit(chorus_bin::run());
}
