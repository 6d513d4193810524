//! Renders the `linkroute(1)` manual page from the clap definition.

use std::{env, fs, io, path::Path};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli.rs"]
mod cli;

const MAN_DIR: &str = "target/generated-man";

fn render(dir: &Path) -> io::Result<()> {
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let man = Man::new(cli::Cli::command())
        .section("1")
        .source(format!("linkroute {version}"))
        .manual("linkroute manual");
    let mut page = Vec::new();
    man.render(&mut page)?;
    fs::create_dir_all(dir)?;
    fs::write(dir.join("linkroute.1"), page)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    render(Path::new(MAN_DIR))?;
    Ok(())
}
