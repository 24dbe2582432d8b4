//! Token-counted text chunking.
//!
//! Chunk boundaries are found recursively by the splitter (paragraphs,
//! sentences, words) while sizes are measured in cl100k tokens, so the
//! configured `chunk_size` maps directly onto embedder input budgets.

use text_splitter::{ChunkConfig, TextSplitter};
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::error::{RecallError, Result};

pub struct Chunker {
    splitter: TextSplitter<CoreBPE>,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        let tokenizer = cl100k_base()
            .map_err(|e| RecallError::config(format!("cl100k tokenizer unavailable: {e}")))?;
        let config = ChunkConfig::new(chunk_size)
            .with_sizer(tokenizer)
            .with_overlap(chunk_overlap)
            .map_err(|e| RecallError::config(format!("invalid chunker parameters: {e}")))?;
        Ok(Self {
            splitter: TextSplitter::new(config),
        })
    }

    /// Split text into chunks of at most `chunk_size` tokens.
    pub fn chunks(&self, text: &str) -> Vec<String> {
        self.splitter
            .chunks(text)
            .map(|chunk| chunk.to_string())
            .collect()
    }
}
