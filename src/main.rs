fn main() {
    formsplit::run();
}
