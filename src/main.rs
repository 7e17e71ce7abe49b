fn main() -> anyhow::Result<()> {
    taskboard_lib::run()
}
