use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sediment::index::META_DIR;
use sediment::persistence::MetaStore;
use sediment::segment::{FileSegment, Segment};
use sediment::{rollback_points_at, Index, IndexConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "sediment-inspect")]
#[command(about = "Inspect sediment segment files and index directories", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the footer of a segment file
    Footer { segment: PathBuf },

    /// List the fields of a segment file
    Fields { segment: PathBuf },

    /// Dump the term dictionary of one field
    Dict {
        segment: PathBuf,
        field: String,
        /// Only terms starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Print the stored fields of a document by doc number
    Doc { segment: PathBuf, doc_num: u64 },

    /// List the metadata records of an index directory, newest first
    Records {
        #[arg(env = "SEDIMENT_INDEX_DIR")]
        index: PathBuf,
    },

    /// List the rollback points of a closed index
    RollbackPoints {
        #[arg(env = "SEDIMENT_INDEX_DIR")]
        index: PathBuf,
    },

    /// Open an index read-only and summarize its current snapshot
    Summary {
        #[arg(env = "SEDIMENT_INDEX_DIR")]
        index: PathBuf,
    },
}

fn open_segment(path: &PathBuf) -> Result<FileSegment> {
    FileSegment::open(path).with_context(|| format!("opening segment {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("sediment-inspect v{}", sediment::VERSION);

    match args.command {
        Command::Footer { segment } => {
            let seg = open_segment(&segment)?;
            let footer = seg.base().footer();
            println!("file:                {}", segment.display());
            println!("size:                {}", seg.size());
            println!("version:             {}", footer.version);
            println!("docs:                {}", footer.num_docs);
            println!("chunk factor:        {}", footer.chunk_factor);
            println!("stored index:        {}", footer.stored_index_offset);
            println!("fields index:        {}", footer.fields_index_offset);
            println!("doc values index:    {}", footer.doc_values_index_offset);
            println!("crc:                 {:08x}", footer.crc);
        }
        Command::Fields { segment } => {
            let seg = open_segment(&segment)?;
            let with_doc_values = seg.base().doc_value_fields();
            for (id, name) in seg.fields().iter().enumerate() {
                let terms = seg.dictionary(name)?.len();
                let dv = if with_doc_values.contains(&name.as_str()) { " docvalues" } else { "" };
                println!("{id:>4} {name} terms={terms}{dv}");
            }
        }
        Command::Dict { segment, field, prefix } => {
            let seg = open_segment(&segment)?;
            if !seg.fields().iter().any(|f| *f == field) {
                bail!("segment has no field named {field:?}");
            }
            let dict = seg.dictionary(&field)?;
            let entries = match prefix {
                Some(p) => dict.prefix_entries(p.as_bytes(), None)?,
                None => dict.entries(None)?,
            };
            for entry in entries {
                println!("{}\t{}", String::from_utf8_lossy(&entry.term), entry.count);
            }
        }
        Command::Doc { segment, doc_num } => {
            let seg = open_segment(&segment)?;
            if doc_num >= seg.count() {
                bail!("doc number {doc_num} out of range, segment holds {}", seg.count());
            }
            seg.visit_stored(doc_num, &mut |v| {
                let shown = match std::str::from_utf8(v.value) {
                    Ok(s) => s.to_string(),
                    Err(_) => format!("{:?}", v.value),
                };
                if v.array_positions.is_empty() {
                    println!("{} ({:?}): {}", v.field, v.kind, shown);
                } else {
                    println!("{} ({:?}) {:?}: {}", v.field, v.kind, v.array_positions, shown);
                }
                true
            })?;
        }
        Command::Records { index } => {
            let meta = MetaStore::open(&index.join(META_DIR))?;
            for epoch in meta.epochs()?.into_iter().rev() {
                let Some(record) = meta.get(epoch)? else {
                    continue;
                };
                println!(
                    "epoch {} at {} ({} v{})",
                    record.epoch,
                    record.persisted_at.to_rfc3339(),
                    record.segment_type,
                    record.segment_version
                );
                for segment in &record.segments {
                    let deleted = if segment.deleted.is_some() { " +deletions" } else { "" };
                    println!("  {:>6} {}{}", segment.id, segment.path, deleted);
                }
            }
        }
        Command::RollbackPoints { index } => {
            for point in rollback_points_at(&index)? {
                let keys: Vec<String> = point
                    .meta()
                    .keys()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .collect();
                println!("{}\t{}", point.epoch(), keys.join(","));
            }
        }
        Command::Summary { index } => {
            let index = Index::open(IndexConfig::new(&index).with_read_only(true))?;
            let reader = index.reader();
            println!("epoch:     {}", reader.epoch());
            println!("documents: {}", reader.doc_count());
            println!("segments:  {}", reader.segments().len());
            for segment in reader.segments() {
                let deleted = segment.deleted().map_or(0, |d| d.len());
                println!("  {:>6} docs={} deleted={}", segment.id(), segment.full_size(), deleted);
            }
            index.close()?;
        }
    }
    Ok(())
}
