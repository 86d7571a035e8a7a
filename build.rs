//! Build script for voicetotex
//!
//! Renders man pages for the host CLI (voicetotex.1 plus one page per
//! subcommand) with clap_mangen.

use clap::CommandFactory;
use clap_mangen::Man;
use std::env;
use std::fs::{self, File};
use std::io::Error;
use std::path::{Path, PathBuf};

// Shared with the binary so the pages always match the parser
include!("src/cli.rs");

fn render_page(cmd: clap::Command, path: &Path) -> Result<(), Error> {
    let mut file = File::create(path)?;
    Man::new(cmd).render(&mut file)
}

fn main() -> Result<(), Error> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=VOICETOTEX_GEN_MANPAGES");

    // Release builds always get pages; debug builds only on request
    let profile = env::var("PROFILE").unwrap_or_default();
    if profile != "release" && env::var_os("VOICETOTEX_GEN_MANPAGES").is_none() {
        return Ok(());
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap_or_else(|_| "target".to_string()));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let cmd = Cli::command();
    let bin = cmd.get_name().to_string();

    // voicetotex.1
    render_page(cmd.clone(), &man_dir.join(format!("{}.1", bin)))?;

    // voicetotex-run.1, voicetotex-provision.1, ...
    for subcommand in cmd.get_subcommands().filter(|s| s.get_name() != "help") {
        let page = man_dir.join(format!("{}-{}.1", bin, subcommand.get_name()));
        render_page(subcommand.clone(), &page)?;
    }

    println!("cargo:warning=Man pages generated in: {}", man_dir.display());

    Ok(())
}
