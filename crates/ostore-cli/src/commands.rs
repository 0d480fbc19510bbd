use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use ostore_client::{ObjectStore, TransferSession};
use ostore_crypto::MultiHasher;
use ostore_protocol::SUBJECT_PREFIX;
use ostore_server::{FsBackend, StoreService};
use ostore_transport::LoopbackTransport;
use ostore_types::{BucketName, Digest, ObjectHeaders, ObjectMetadata, ObjectName};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::*;
use crate::config::CliConfig;

/// Block size for `generate` writes and `hash` reads.
const BLOCK_SIZE: usize = 64 * 1024;

/// Directory under the root holding buckets.
const DATA_DIR: &str = "data";

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Generate(args) => cmd_generate(args, format).await,
        Command::Hash(args) if args.name.is_none() => cmd_hash(args, None, format).await,
        command => {
            let harness = Harness::open(&cli.root, cli.config.as_deref(), &cli.bucket)?;
            let result = harness.run(command, format).await;
            harness.shutdown().await;
            result
        }
    }
}

/// A store service over the local root, reached through a loopback
/// transport, with its maintenance task running in the background.
struct Harness {
    store: ObjectStore,
    bucket: BucketName,
    cancel: CancellationToken,
    maintenance: JoinHandle<()>,
}

impl Harness {
    fn open(root: &Path, config: Option<&Path>, bucket: &str) -> anyhow::Result<Self> {
        let config = CliConfig::load(root, config)?;
        let bucket = BucketName::new(bucket)?;
        let data = root.join(DATA_DIR);
        let backend = FsBackend::open(&data)
            .with_context(|| format!("opening store at {}", data.display()))?;
        let service = Arc::new(StoreService::open(Arc::new(backend), config.server)?);
        let cancel = CancellationToken::new();
        let maintenance = service.spawn_maintenance(cancel.clone());
        let transport = LoopbackTransport::new(service, format!("{SUBJECT_PREFIX}."));
        let store = ObjectStore::new(Arc::new(transport), config.store)?;
        debug!(root = %root.display(), %bucket, "store opened");
        Ok(Self {
            store,
            bucket,
            cancel,
            maintenance,
        })
    }

    async fn run(&self, command: Command, format: OutputFormat) -> anyhow::Result<()> {
        match command {
            Command::Put(args) => self.cmd_put(args, format).await,
            Command::Get(args) => self.cmd_get(args, format).await,
            Command::List => self.cmd_list(format).await,
            Command::Delete(args) => self.cmd_delete(args, format).await,
            Command::Info(args) => self.cmd_info(args, format).await,
            Command::Buckets => self.cmd_buckets(format).await,
            Command::Hash(args) => {
                let stored = match &args.name {
                    Some(name) => Some(self.store.info(&self.bucket, &ObjectName::new(name.as_str())?).await?),
                    None => None,
                };
                cmd_hash(args, stored, format).await
            }
            Command::Generate(args) => cmd_generate(args, format).await,
        }
    }

    /// Stop maintenance after one last pass so released chunks are reclaimed
    /// before the process exits.
    async fn shutdown(self) {
        if let Err(e) = self.store.close().await {
            debug!(error = %e, "transport close failed");
        }
        self.cancel.cancel();
        if let Err(e) = self.maintenance.await {
            warn!(error = %e, "maintenance task failed");
        }
    }

    async fn cmd_put(&self, args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
        let name = match args.name {
            Some(name) => ObjectName::new(name)?,
            None => ObjectName::new(args.file.display().to_string())?,
        };
        let file = tokio::fs::File::open(&args.file)
            .await
            .with_context(|| format!("opening {}", args.file.display()))?;
        self.store.create_bucket(&self.bucket).await?;

        let headers: ObjectHeaders = args.headers.into_iter().collect();
        let session = self.store.session();
        let _interrupt = InterruptGuard::new(&session);
        let meta = self
            .store
            .put_with(&session, &self.bucket, &name, headers, file)
            .await
            .with_context(|| format!("storing {} as {}/{}", args.file.display(), self.bucket, name))?;

        match format {
            OutputFormat::Text => {
                let stats = session.stats();
                println!(
                    "{} Stored {} as {} revision {}",
                    "✓".green().bold(),
                    args.file.display(),
                    format!("{}/{}", meta.bucket, meta.name).bold(),
                    meta.revision.to_string().yellow()
                );
                print_meta(&meta);
                println!(
                    "  Transfer: {} bytes in {} chunks, {} retries",
                    stats.bytes, stats.chunks, stats.retries
                );
            }
            OutputFormat::Json => print_json(&meta)?,
        }
        Ok(())
    }

    async fn cmd_get(&self, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
        let name = ObjectName::new(args.name)?;
        let mut reader = match args.revision {
            Some(revision) => self.store.get_revision(&self.bucket, &name, revision).await?,
            None => self.store.get(&self.bucket, &name).await?,
        };
        if format == OutputFormat::Text {
            println!("{} {}/{}", "Object".bold(), reader.metadata().bucket, reader.metadata().name);
            print_meta(reader.metadata());
        }

        let _interrupt = InterruptGuard::new(reader.session());
        let mut file = tokio::fs::File::create(&args.file)
            .await
            .with_context(|| format!("creating {}", args.file.display()))?;
        let written = reader
            .copy_to(&mut file)
            .await
            .with_context(|| format!("retrieving {}/{} into {}", self.bucket, name, args.file.display()))?;
        file.flush().await?;

        match format {
            OutputFormat::Text => println!(
                "{} Wrote {} bytes to {} (digest verified)",
                "✓".green().bold(),
                written,
                args.file.display()
            ),
            OutputFormat::Json => print_json(reader.metadata())?,
        }
        Ok(())
    }

    async fn cmd_list(&self, format: OutputFormat) -> anyhow::Result<()> {
        let mut lister = self.store.list(&self.bucket);
        let mut entries = Vec::new();
        while let Some(meta) = lister.next().await? {
            if format == OutputFormat::Text {
                println!(
                    "{:>4}  {:>12}  {}  {}",
                    format!("r{}", meta.revision).yellow(),
                    meta.size,
                    meta.modified_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    meta.name
                );
            }
            entries.push(meta);
        }
        match format {
            OutputFormat::Text if entries.is_empty() => println!("No objects in {}.", self.bucket),
            OutputFormat::Text => println!("{} objects", entries.len().to_string().bold()),
            OutputFormat::Json => print_json(&entries)?,
        }
        Ok(())
    }

    async fn cmd_delete(&self, args: NameArgs, format: OutputFormat) -> anyhow::Result<()> {
        let name = ObjectName::new(args.name)?;
        let meta = self.store.delete(&self.bucket, &name).await?;
        match format {
            OutputFormat::Text => println!(
                "{} Deleted {} (revision {})",
                "✓".green().bold(),
                format!("{}/{}", meta.bucket, meta.name).bold(),
                meta.revision
            ),
            OutputFormat::Json => print_json(&meta)?,
        }
        Ok(())
    }

    async fn cmd_info(&self, args: NameArgs, format: OutputFormat) -> anyhow::Result<()> {
        let name = ObjectName::new(args.name)?;
        let revisions = self.store.revisions(&self.bucket, &name).await?;
        match format {
            OutputFormat::Text => {
                let Some((current, retained)) = revisions.split_first() else {
                    bail!("no revisions for {}/{}", self.bucket, name);
                };
                println!("{} {}/{}", "Object".bold(), current.bucket, current.name);
                print_meta(current);
                if !retained.is_empty() {
                    println!("  Retained:");
                    for meta in retained {
                        println!(
                            "    {}  {} bytes  {}",
                            format!("r{}", meta.revision).yellow(),
                            meta.size,
                            meta.digest
                        );
                    }
                }
            }
            OutputFormat::Json => print_json(&revisions)?,
        }
        Ok(())
    }

    async fn cmd_buckets(&self, format: OutputFormat) -> anyhow::Result<()> {
        let mut rows = Vec::new();
        for bucket in self.store.list_buckets().await? {
            let status = self.store.bucket_status(&bucket).await?;
            rows.push(BucketRow {
                bucket: status.bucket.to_string(),
                objects: status.objects,
                total_size: status.total_size,
            });
        }
        match format {
            OutputFormat::Text if rows.is_empty() => println!("No buckets."),
            OutputFormat::Text => {
                for row in &rows {
                    println!(
                        "{:<20} {:>6} objects {:>14} bytes",
                        row.bucket.bold(),
                        row.objects,
                        row.total_size
                    );
                }
            }
            OutputFormat::Json => print_json(&rows)?,
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct BucketRow {
    bucket: String,
    objects: u64,
    total_size: u64,
}

/// Cancels a session on Ctrl-C until dropped.
struct InterruptGuard(JoinHandle<()>);

impl InterruptGuard {
    fn new(session: &TransferSession) -> Self {
        let token = session.cancel_token().clone();
        Self(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling transfer");
                token.cancel();
            }
        }))
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn cmd_generate(args: GenerateArgs, format: OutputFormat) -> anyhow::Result<()> {
    let size = args.size.bytes();
    let mut file = tokio::fs::File::create(&args.file)
        .await
        .with_context(|| format!("creating {}", args.file.display()))?;
    let mut rng = StdRng::from_entropy();
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(BLOCK_SIZE as u64) as usize;
        rng.fill_bytes(&mut block[..n]);
        file.write_all(&block[..n])
            .await
            .with_context(|| format!("writing {}", args.file.display()))?;
        remaining -= n as u64;
    }
    file.flush().await?;

    match format {
        OutputFormat::Text => println!("generated {} bytes at {}", size, args.file.display()),
        OutputFormat::Json => print_json(&serde_json::json!({
            "file": args.file.display().to_string(),
            "size": size,
        }))?,
    }
    Ok(())
}

/// One digest of the `hash` command in every text encoding.
#[derive(Serialize)]
struct HashRow {
    algorithm: String,
    hex: String,
    base64: String,
    base64url: String,
    base64url_padded: String,
    stored_form: String,
    /// The stored form parses back to the same digest.
    stored_form_roundtrips: bool,
    /// Agreement with the stored object's digest, when it used this algorithm.
    #[serde(skip_serializing_if = "Option::is_none")]
    matches_object: Option<bool>,
}

impl HashRow {
    fn new(digest: &Digest, stored: Option<&ObjectMetadata>) -> Self {
        let stored_form = digest.to_string();
        let stored_form_roundtrips = Digest::parse(&stored_form).is_ok_and(|d| &d == digest);
        let matches_object = stored
            .filter(|meta| meta.digest.algorithm() == digest.algorithm())
            .map(|meta| &meta.digest == digest);
        Self {
            algorithm: digest.algorithm().to_string(),
            hex: digest.to_hex(),
            base64: digest.to_base64(),
            base64url: digest.to_base64url(),
            base64url_padded: digest.to_base64url_padded(),
            stored_form,
            stored_form_roundtrips,
            matches_object,
        }
    }
}

async fn cmd_hash(
    args: HashArgs,
    stored: Option<ObjectMetadata>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("opening {}", args.file.display()))?;
    let mut hasher = MultiHasher::all();
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file
            .read(&mut block)
            .await
            .with_context(|| format!("reading {}", args.file.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
        size += n as u64;
    }
    let rows: Vec<HashRow> = hasher
        .finalize()
        .iter()
        .map(|digest| HashRow::new(digest, stored.as_ref()))
        .collect();

    match format {
        OutputFormat::Text => {
            println!("{}: {} bytes", args.file.display().to_string().bold(), size);
            for row in &rows {
                println!("{}", row.algorithm.cyan().bold());
                println!("  hex        {}", row.hex);
                println!("  b64        {}", row.base64);
                println!("  b64url     {}", row.base64url);
                println!("  b64padded  {}", row.base64url_padded);
                let parses = if row.stored_form_roundtrips { "✓".green() } else { "✗".red() };
                println!("  stored     {} {}", row.stored_form, parses);
                match (row.matches_object, stored.as_ref()) {
                    (Some(true), Some(meta)) => {
                        println!("  object     {} matches {}/{}", "✓".green(), meta.bucket, meta.name)
                    }
                    (Some(false), Some(meta)) => {
                        println!("  object     {} differs from {}/{}", "✗".red(), meta.bucket, meta.name)
                    }
                    _ => {}
                }
            }
        }
        OutputFormat::Json => print_json(&rows)?,
    }

    if rows.iter().any(|row| !row.stored_form_roundtrips) {
        bail!("digest encodings of {} disagree", args.file.display());
    }
    if rows.iter().any(|row| row.matches_object == Some(false)) {
        bail!("{} differs from the stored object", args.file.display());
    }
    Ok(())
}

fn print_meta(meta: &ObjectMetadata) {
    println!("  Revision: {} ({})", meta.revision.to_string().yellow(), meta.revision_id);
    println!("  Size: {} bytes", meta.size);
    println!("  Chunks: {} x {} bytes", meta.chunk_count, meta.chunk_size);
    println!("  Digest: {}", meta.digest.to_string().cyan());
    println!("  Modified: {}", meta.modified_at.to_rfc3339());
    for (key, value) in &meta.headers {
        println!("  {}: {}", key.dimmed(), value);
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use ostore_client::StoreError;
    use ostore_types::DigestAlgorithm;

    async fn run(root: &Path, args: &[&str]) -> anyhow::Result<()> {
        let mut argv = vec!["ostore", "--root", root.to_str().unwrap()];
        argv.extend_from_slice(args);
        run_command(Cli::try_parse_from(argv).unwrap()).await
    }

    async fn open(root: &Path) -> Harness {
        Harness::open(root, None, "test").unwrap()
    }

    #[tokio::test]
    async fn generate_writes_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gen.bin");
        let f = file.to_str().unwrap();
        run(dir.path(), &["generate", "--size", "70000", "--file", f]).await.unwrap();
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 70_000);

        run(dir.path(), &["generate", "--size", "0", "--file", f]).await.unwrap();
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        let (s, d) = (src.to_str().unwrap(), dst.to_str().unwrap());

        run(dir.path(), &["generate", "--size", "300k", "--file", s]).await.unwrap();
        run(dir.path(), &["put", "--file", s, "--name", "blob"]).await.unwrap();
        run(dir.path(), &["get", "--name", "blob", "--file", d]).await.unwrap();
        assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dst).unwrap());
    }

    #[tokio::test]
    async fn put_defaults_name_to_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("named.txt");
        std::fs::write(&src, b"hello").unwrap();
        let s = src.to_str().unwrap();
        run(dir.path(), &["put", "--file", s]).await.unwrap();

        let harness = open(dir.path()).await;
        let meta = harness.store.info(&harness.bucket, &ObjectName::new(s).unwrap()).await.unwrap();
        assert_eq!(meta.size, 5);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn store_survives_restart_and_counts_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let s = src.to_str().unwrap();
        std::fs::write(&src, b"one").unwrap();
        run(dir.path(), &["put", "--file", s, "--name", "a", "--header", "kind=text"]).await.unwrap();
        std::fs::write(&src, b"two!").unwrap();
        run(dir.path(), &["put", "--file", s, "--name", "a"]).await.unwrap();

        let harness = open(dir.path()).await;
        let meta = harness.store.info(&harness.bucket, &ObjectName::new("a").unwrap()).await.unwrap();
        assert_eq!(meta.revision, 2);
        assert_eq!(meta.size, 4);
        let objects = harness.store.list(&harness.bucket).collect().await.unwrap();
        assert_eq!(objects.len(), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn config_file_sets_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::config::CONFIG_FILE),
            "[store]\nchunk_size = 1024\ndigest = \"blake3\"\n",
        )
        .unwrap();
        let src = dir.path().join("c.bin");
        let s = src.to_str().unwrap();
        run(dir.path(), &["generate", "--size", "5000", "--file", s]).await.unwrap();
        run(dir.path(), &["put", "--file", s, "--name", "c"]).await.unwrap();

        let harness = open(dir.path()).await;
        let meta = harness.store.info(&harness.bucket, &ObjectName::new("c").unwrap()).await.unwrap();
        assert_eq!(meta.chunk_count, 5);
        assert_eq!(meta.digest.algorithm(), DigestAlgorithm::Blake3);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("d.txt");
        let s = src.to_str().unwrap();
        std::fs::write(&src, b"bye").unwrap();
        run(dir.path(), &["put", "--file", s, "--name", "d"]).await.unwrap();
        run(dir.path(), &["delete", "--name", "d"]).await.unwrap();

        let out = dir.path().join("out");
        let err = run(dir.path(), &["get", "--name", "d", "--file", out.to_str().unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn missing_input_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let m = missing.to_str().unwrap();
        assert!(run(dir.path(), &["put", "--file", m]).await.is_err());
        assert!(run(dir.path(), &["hash", "--file", m]).await.is_err());
    }

    #[tokio::test]
    async fn hash_agrees_with_stored_object() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("h.bin");
        let s = src.to_str().unwrap();
        run(dir.path(), &["generate", "--size", "1k", "--file", s]).await.unwrap();
        run(dir.path(), &["hash", "--file", s]).await.unwrap();
        run(dir.path(), &["put", "--file", s, "--name", "h"]).await.unwrap();
        run(dir.path(), &["hash", "--file", s, "--name", "h"]).await.unwrap();

        std::fs::write(&src, b"changed").unwrap();
        assert!(run(dir.path(), &["hash", "--file", s, "--name", "h"]).await.is_err());
    }

    #[test]
    fn hash_rows_cover_every_encoding() {
        let digest = ostore_crypto::digest_of(DigestAlgorithm::Sha256, b"");
        let row = HashRow::new(&digest, None);
        assert_eq!(row.hex, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
        assert_eq!(row.base64, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
        assert_eq!(row.base64url, "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU");
        assert_eq!(row.base64url_padded, "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU=");
        assert!(row.stored_form.starts_with("SHA-256="));
        assert!(row.stored_form_roundtrips);
        assert_eq!(row.matches_object, None);
    }

    #[tokio::test]
    async fn list_info_and_buckets_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("l.txt");
        let s = src.to_str().unwrap();
        std::fs::write(&src, b"x").unwrap();
        run(dir.path(), &["put", "--file", s, "--name", "l"]).await.unwrap();
        run(dir.path(), &["list"]).await.unwrap();
        run(dir.path(), &["--format", "json", "list"]).await.unwrap();
        run(dir.path(), &["info", "--name", "l"]).await.unwrap();
        run(dir.path(), &["buckets"]).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_bucket_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path(), &["--bucket", "bad.name", "list"]).await.is_err());
    }
}
