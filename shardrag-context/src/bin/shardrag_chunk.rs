use clap::Parser;
use serde::Serialize;
use shardrag_context::document::{DocumentReader, FsDocumentReader};
use shardrag_context::text::{DEFAULT_CHUNK_CHARS, DEFAULT_OVERLAP_CHARS, DocumentChunker};
use std::io::{self, Read};
use std::path::PathBuf;

/// Chunk a document the same way shards are built, and print the chunks as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input document (text or PDF). If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Maximum length of each chunk, in characters.
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHUNK_CHARS)]
    chunk_chars: usize,

    /// Overlap between forced windows, in characters.
    #[arg(short = 'o', long, default_value_t = DEFAULT_OVERLAP_CHARS)]
    overlap_chars: usize,
}

#[derive(Serialize)]
struct ChunkOutput<'a> {
    index: usize,
    text: &'a str,
    hash: String,
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    let chunker = DocumentChunker::checked(args.chunk_chars, args.overlap_chars)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let content = if let Some(input_path) = args.input {
        FsDocumentReader::new().read_text(&input_path)
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let chunks = chunker.chunks(&content);

    let output: Vec<ChunkOutput> = chunks
        .iter()
        .map(|c| ChunkOutput {
            index: c.index,
            text: &c.text,
            hash: c.hash(),
        })
        .collect();

    let json_output = serde_json::to_string_pretty(&output)?;
    println!("{json_output}");

    Ok(())
}
