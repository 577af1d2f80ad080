use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fn_error_context::context;

use diskrepo::{
    config::Config,
    index::MetadataValue,
    repository::{IngestMetadata, Repository, RepositoryConfig},
};

/// diskrepo
#[derive(Debug, Parser)]
#[clap(name = "diskrepo", version)]
pub struct App {
    /// Path of the repository directory
    #[clap(long, group = "repopath")]
    repo: Option<PathBuf>,
    /// Configuration file naming the repositories
    #[clap(long, group = "repopath")]
    config: Option<PathBuf>,
    /// Repository to use from the configuration file
    #[clap(long, conflicts_with = "repo")]
    name: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stores a disk image in the repository
    Add {
        file: PathBuf,
        /// Tag to give the stored image
        #[clap(long)]
        tag: Option<String>,
        /// Digest, digest prefix or tag of the image to store this one on top of
        #[clap(long)]
        parent: Option<String>,
        /// The file is already a stored artifact with this digest
        #[clap(long)]
        digest: Option<String>,
        /// Extra metadata, repeatable
        #[clap(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, MetadataValue)>,
    },
    /// Points a tag at an image
    Tag { reference: String, tag: String },
    /// Removes a tag
    Untag { tag: String },
    /// Lists the images in the repository
    List,
    /// Prints the metadata of an image as JSON
    Show { reference: String },
    /// Copies the index and all images to another directory
    Publish {
        target: PathBuf,
        /// Write images zstd-compressed
        #[clap(long)]
        compress: bool,
    },
    /// Creates a copy-on-write disk on top of a stored image
    Overlay {
        reference: String,
        destination: PathBuf,
        /// Virtual size in bytes (defaults to the size of the stored image)
        #[clap(long)]
        size: Option<u64>,
    },
    /// Compares the index with the images on disk
    Check,
}

fn parse_meta(arg: &str) -> Result<(String, MetadataValue), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => {
            Ok((key.to_string(), MetadataValue::parse(value)))
        }
        _ => Err(format!("expected KEY=VALUE, got '{arg}'")),
    }
}

fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os("DISKREPO_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = env::var_os("HOME").context("Neither $DISKREPO_CONFIG nor $HOME is set")?;
    Ok(PathBuf::from(home).join(".config/diskrepo/config.toml"))
}

#[context("Reading configuration from {}", path.display())]
fn repository_config(path: &Path, name: Option<&str>) -> Result<RepositoryConfig> {
    Ok(Config::load(path)?.repository(name)?)
}

#[context("Opening repository")]
fn open_repository(args: &App) -> Result<Repository> {
    let config = match (&args.repo, &args.config) {
        (Some(path), _) => RepositoryConfig::new(path),
        (None, Some(config)) => repository_config(config, args.name.as_deref())?,
        (None, None) => repository_config(&default_config_path()?, args.name.as_deref())?,
    };
    Ok(Repository::open(config)?)
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    let args = App::parse();
    let mut repo = open_repository(&args)?;

    match args.cmd {
        Command::Add {
            ref file,
            tag,
            parent,
            digest,
            meta,
        } => {
            let ingested = repo
                .put_file(
                    file,
                    IngestMetadata {
                        tag,
                        parent,
                        digest,
                        extra: meta.into_iter().collect::<BTreeMap<_, _>>(),
                        ..Default::default()
                    },
                )
                .with_context(|| format!("Adding {}", file.display()))?;
            for warning in &ingested.warnings {
                eprintln!("warning: {warning}");
            }
            println!("{}", ingested.image.digest);
        }
        Command::Tag {
            ref reference,
            ref tag,
        } => {
            let image = repo.tag(reference, tag)?;
            println!("{}", image.digest);
        }
        Command::Untag { ref tag } => match repo.untag(tag)? {
            Some(digest) => println!("{digest}"),
            None => bail!("No such tag '{tag}'"),
        },
        Command::List => {
            for image in repo.images().values() {
                println!(
                    "{}  {:<20}  {:<12}  {}",
                    short(&image.digest),
                    image.tag.as_deref().unwrap_or("-"),
                    image.parent_digest.as_deref().map(short).unwrap_or("-"),
                    image.created_at.to_rfc3339(),
                );
            }
        }
        Command::Show { ref reference } => {
            let image = repo
                .get(reference)
                .with_context(|| format!("No image matches '{reference}'"))?;
            println!("{}", serde_json::to_string_pretty(image)?);
        }
        Command::Publish {
            ref target,
            compress,
        } => {
            let report = repo.publish(target, compress)?;
            println!(
                "{} copied, {} compressed, {} skipped",
                report.copied.len(),
                report.compressed.len(),
                report.skipped.len()
            );
            if !report.is_complete() {
                for failure in &report.failed {
                    eprintln!("error: {}: {}", failure.digest, failure.error);
                }
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Overlay {
            ref reference,
            ref destination,
            size,
        } => {
            repo.create_overlay(reference, destination, size)?;
        }
        Command::Check => {
            let report = repo.check()?;
            for digest in &report.missing_artifacts {
                println!("missing artifact: {digest}");
            }
            for path in &report.unindexed_artifacts {
                println!("unindexed artifact: {}", path.display());
            }
            for (digest, parent) in &report.dangling_parents {
                println!("dangling parent: {digest} -> {parent}");
            }
            for tag in &report.dangling_tags {
                println!("dangling tag: {tag}");
            }
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
