fn main() -> Result<(), Box<dyn std::error::Error>> {
    picapture_lib::run()
}
