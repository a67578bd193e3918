use anyhow::Result;

fn main() -> Result<()> {
    appbox::cli::run()
}
