use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ostore_types::ByteSize;

#[derive(Parser)]
#[command(
    name = "ostore",
    about = "Chunked object store harness: put, get, list and hash objects",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the store data and `ostore.toml`
    #[arg(long, global = true, default_value = ".ostore")]
    pub root: PathBuf,

    /// Configuration file (default: `<root>/ostore.toml` if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Bucket to operate on
    #[arg(short, long, global = true, default_value = "test")]
    pub bucket: String,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a file as the new current revision of an object
    Put(PutArgs),
    /// Stream an object into a file, verifying its digest
    Get(GetArgs),
    /// Write a file of random bytes
    Generate(GenerateArgs),
    /// Print the digests of a file in every supported encoding
    Hash(HashArgs),
    /// List the objects of the bucket in commit order
    List,
    /// Delete an object
    Delete(NameArgs),
    /// Show an object's metadata and retained revisions
    Info(NameArgs),
    /// List buckets with their object counts
    Buckets,
}

#[derive(Args)]
pub struct PutArgs {
    #[arg(long)]
    pub file: PathBuf,
    /// Object name (default: the file path)
    #[arg(long)]
    pub name: Option<String>,
    /// Object header as `key=value`, repeatable
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
}

#[derive(Args)]
pub struct GetArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub file: PathBuf,
    /// Read a retained revision instead of the current one
    #[arg(long)]
    pub revision: Option<u64>,
}

#[derive(Args)]
pub struct GenerateArgs {
    /// Size as `N[k|kib|m|mib|g|gib]`
    #[arg(long)]
    pub size: ByteSize,
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Args)]
pub struct HashArgs {
    #[arg(long)]
    pub file: PathBuf,
    /// Compare against the stored digest of this object
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct NameArgs {
    #[arg(long)]
    pub name: String,
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{s}`")),
    }
}
