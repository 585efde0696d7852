//! Model runtime context
//!
//! [`RwkvContext`] owns a loaded model, its wired single-token graph, and a
//! worker pool with the thread count fixed at creation. One context serves
//! one stream of tokens; `eval` takes `&mut self`, so concurrent steps on
//! the same context are ruled out at compile time. Contexts are independent
//! of one another.

use crate::error::{RecordarError, Result};
use crate::format::{read_bytes, skip, FileHeader, TensorHeader};
use crate::graph::{Graph, ATT_PP_PART, FRESH_STATE_SENTINEL, STATE_PARTS_PER_LAYER};
use crate::model::Model;
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

/// Byte offset of the first tensor record
const TENSOR_STREAM_START: u64 = 24;

/// A loaded model ready for single-token evaluation
#[derive(Debug)]
pub struct RwkvContext {
    model: Model,
    graph: Graph,
    pool: rayon::ThreadPool,
    n_threads: usize,
}

impl RwkvContext {
    /// Load a model file and wire its graph.
    ///
    /// The file is walked twice: a sizing pass validates every record,
    /// discovers the feed-forward inner width, and skips payloads with
    /// 64-bit seeks; the data pass then loads the tensors. All offset
    /// arithmetic is 64-bit, so files past 4 GiB stream correctly.
    ///
    /// # Errors
    ///
    /// `Args` for a zero thread count; file, format, schema, and graph
    /// errors as described on [`crate::RecordarError`]. On any failure the
    /// partial load is dropped and nothing leaks.
    pub fn init_from_file(path: impl AsRef<Path>, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(RecordarError::Args {
                reason: "thread count must be at least 1".to_string(),
            });
        }

        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RecordarError::FileOpen {
            path: path.display().to_string(),
            source: e,
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| RecordarError::FileStat {
                path: path.display().to_string(),
                source: e,
            })?
            .len();
        let mut reader = BufReader::new(file);

        let header = FileHeader::read(&mut reader)?;

        // Sizing pass: validate all records up front, find F.
        let mut record_count = 0usize;
        let mut ffn_width: Option<usize> = None;
        let mut pos = TENSOR_STREAM_START;
        while pos < file_len {
            let tensor_header = TensorHeader::read(&mut reader)?;
            let key = read_bytes(&mut reader, tensor_header.key_length as usize, "tensor name")?;
            skip(&mut reader, tensor_header.payload_bytes(), "tensor data")?;

            if ffn_width.is_none() && key == b"blocks.0.ffn.key.weight" {
                ffn_width = Some(tensor_header.height as usize);
            }

            record_count += 1;
            pos += tensor_header.record_bytes();
        }

        if ffn_width.is_none() {
            return Err(RecordarError::ParamMissing {
                name: "blocks.0.ffn.key.weight".to_string(),
            });
        }

        reader
            .seek(SeekFrom::Start(TENSOR_STREAM_START))
            .map_err(|e| RecordarError::FileSeek {
                what: "start of tensor stream".to_string(),
                source: e,
            })?;

        // Data pass. Duplicate keys follow last-wins, like the map insert.
        let mut tensors: HashMap<Vec<u8>, Tensor> = HashMap::with_capacity(record_count);
        let mut pos = TENSOR_STREAM_START;
        while pos < file_len {
            let tensor_header = TensorHeader::read(&mut reader)?;
            let key = read_bytes(&mut reader, tensor_header.key_length as usize, "tensor name")?;
            let payload_len =
                usize::try_from(tensor_header.payload_bytes()).map_err(|_| RecordarError::Shape {
                    reason: "tensor payload exceeds addressable memory".to_string(),
                })?;
            let payload = read_bytes(&mut reader, payload_len, "tensor data")?;
            let tensor = Tensor::from_payload(
                tensor_header.data_type,
                tensor_header.width as usize,
                tensor_header.height as usize,
                payload,
            )?;

            tensors.insert(key, tensor);
            pos += tensor_header.record_bytes();
        }

        let model = Model::from_parameters(&header, tensors)?;
        let graph = Graph::build(&model)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| RecordarError::Capacity {
                reason: format!("failed to create {n_threads} worker threads: {e}"),
            })?;

        Ok(Self {
            model,
            graph,
            pool,
            n_threads,
        })
    }

    /// Advance the model by one token.
    ///
    /// `state_in == None` starts a fresh stream: zeros everywhere except the
    /// `att_pp` slices, which hold the large negative sentinel the running
    /// maximum treats as minus infinity. `state_out` receives the next
    /// state; `logits_out`, when given, receives all `V` logits.
    ///
    /// # Errors
    ///
    /// `Args` if the token is out of range or a buffer length is wrong.
    /// Precondition failures mutate nothing, so the context and the caller's
    /// buffers stay usable for the next call.
    pub fn eval(
        &mut self,
        token: u32,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> Result<()> {
        let n_vocab = self.model.n_vocab();
        let n_embed = self.model.n_embed();
        let state_len = self.state_element_count();

        if token as usize >= n_vocab {
            return Err(RecordarError::Args {
                reason: format!("token {token} is out of range 0..{}", n_vocab - 1),
            });
        }
        if state_out.len() != state_len {
            return Err(RecordarError::Args {
                reason: format!(
                    "state_out holds {} elements, the state needs {state_len}",
                    state_out.len()
                ),
            });
        }
        if let Some(state) = state_in {
            if state.len() != state_len {
                return Err(RecordarError::Args {
                    reason: format!(
                        "state_in holds {} elements, the state needs {state_len}",
                        state.len()
                    ),
                });
            }
        }
        if let Some(logits) = logits_out.as_deref() {
            if logits.len() != n_vocab {
                return Err(RecordarError::Args {
                    reason: format!(
                        "logits_out holds {} elements, the model produces {n_vocab}",
                        logits.len()
                    ),
                });
            }
        }

        self.graph.set_token(token);
        match state_in {
            Some(state) => self.graph.input_state_mut().copy_from_slice(state),
            None => {
                let input = self.graph.input_state_mut();
                input.fill(0.0);
                for layer in 0..self.model.n_layer() {
                    let start = n_embed * (layer * STATE_PARTS_PER_LAYER + ATT_PP_PART);
                    input[start..start + n_embed].fill(FRESH_STATE_SENTINEL);
                }
            }
        }

        let model = &self.model;
        let graph = &mut self.graph;
        self.pool.install(|| graph.execute(model))?;

        for part in 0..graph.state_part_count() {
            let start = part * n_embed;
            state_out[start..start + n_embed].copy_from_slice(graph.state_part(part));
        }
        if let Some(logits) = logits_out {
            logits.copy_from_slice(graph.logits());
        }
        Ok(())
    }

    /// Elements of the recurrent state: `L * 5 * E`.
    #[must_use]
    pub fn state_element_count(&self) -> usize {
        self.model.n_layer() * STATE_PARTS_PER_LAYER * self.model.n_embed()
    }

    /// Elements of the logits vector: `V`.
    #[must_use]
    pub fn logits_element_count(&self) -> usize {
        self.model.n_vocab()
    }

    /// Vocabulary size `V`.
    #[must_use]
    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    /// Embedding width `E`.
    #[must_use]
    pub fn n_embed(&self) -> usize {
        self.model.n_embed()
    }

    /// Layer count `L`.
    #[must_use]
    pub fn n_layer(&self) -> usize {
        self.model.n_layer()
    }

    /// Worker threads fixed at creation.
    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }
}

/// CPU feature flags of the running machine, for diagnostics.
#[must_use]
pub fn system_info() -> String {
    #[cfg(target_arch = "x86_64")]
    {
        format!(
            "AVX={} AVX2={} AVX512={} FMA={} F16C={} SSE3={} SSE4.1={} NEON=0",
            u8::from(std::arch::is_x86_feature_detected!("avx")),
            u8::from(std::arch::is_x86_feature_detected!("avx2")),
            u8::from(std::arch::is_x86_feature_detected!("avx512f")),
            u8::from(std::arch::is_x86_feature_detected!("fma")),
            u8::from(std::arch::is_x86_feature_detected!("f16c")),
            u8::from(std::arch::is_x86_feature_detected!("sse3")),
            u8::from(std::arch::is_x86_feature_detected!("sse4.1")),
        )
    }
    #[cfg(target_arch = "aarch64")]
    {
        "AVX=0 AVX2=0 AVX512=0 FMA=0 F16C=0 SSE3=0 SSE4.1=0 NEON=1".to_string()
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        "AVX=0 AVX2=0 AVX512=0 FMA=0 F16C=0 SSE3=0 SSE4.1=0 NEON=0".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threads_rejected() {
        let err = RwkvContext::init_from_file("/nonexistent/model.bin", 0).unwrap_err();
        assert!(matches!(err, RecordarError::Args { .. }));
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let err = RwkvContext::init_from_file("/nonexistent/model.bin", 1).unwrap_err();
        assert!(matches!(err, RecordarError::FileOpen { .. }));
    }

    #[test]
    fn test_system_info_lists_flags() {
        let info = system_info();
        for flag in ["AVX=", "AVX2=", "FMA=", "NEON="] {
            assert!(info.contains(flag), "missing {flag} in {info}");
        }
    }

}
