fn main() -> anyhow::Result<()> {
    cammaster::cam::main()
}
