fn main() {
    std::process::exit(hotkeyd::run());
}
