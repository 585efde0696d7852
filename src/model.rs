//! Model parameter catalog
//!
//! The canonical parameter-name schema lives here as data: one table of
//! global entries and one table of per-layer templates, each row carrying
//! the parameter name, how its payload is consumed, the shape it must have,
//! and the slot it fills. A single resolver instantiates the templates
//! against the loaded tensor map, validates every shape against the header
//! dimensions, and fails on the first entry that does not resolve. Tensors
//! the schema does not name are dropped.
//!
//! Vector parameters are decoded to f32 here because the element-wise
//! kernels consume them directly; matrices keep their stored type for
//! row-wise consumption.

use crate::error::{RecordarError, Result};
use crate::format::{FileHeader, TensorType};
use crate::tensor::Tensor;
use std::collections::HashMap;

/// Handle to a parameter tensor inside a [`Model`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamId(usize);

impl ParamId {
    /// Placeholder every slot starts from; the resolver overwrites it, one
    /// schema row per slot.
    const UNRESOLVED: ParamId = ParamId(usize::MAX);
}

/// Weights of one RWKV block
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Pre-attention layer norm weight
    pub ln1_weight: ParamId,
    /// Pre-attention layer norm bias
    pub ln1_bias: ParamId,
    /// Key mixing coefficients
    pub att_time_mix_k: ParamId,
    /// Value mixing coefficients
    pub att_time_mix_v: ParamId,
    /// Receptance mixing coefficients
    pub att_time_mix_r: ParamId,
    /// Per-channel bonus for the current token
    pub att_time_first: ParamId,
    /// Per-channel decay added to the running accumulator
    pub att_time_decay: ParamId,
    /// Key projection matrix
    pub att_key: ParamId,
    /// Value projection matrix
    pub att_value: ParamId,
    /// Receptance projection matrix
    pub att_receptance: ParamId,
    /// Output projection matrix
    pub att_output: ParamId,
    /// Pre-feed-forward layer norm weight
    pub ln2_weight: ParamId,
    /// Pre-feed-forward layer norm bias
    pub ln2_bias: ParamId,
    /// Feed-forward key mixing coefficients
    pub ffn_time_mix_k: ParamId,
    /// Feed-forward receptance mixing coefficients
    pub ffn_time_mix_r: ParamId,
    /// Feed-forward up projection (E -> F)
    pub ffn_key: ParamId,
    /// Feed-forward down projection (F -> E)
    pub ffn_value: ParamId,
    /// Feed-forward receptance matrix
    pub ffn_receptance: ParamId,
}

impl LayerWeights {
    const UNRESOLVED: LayerWeights = LayerWeights {
        ln1_weight: ParamId::UNRESOLVED,
        ln1_bias: ParamId::UNRESOLVED,
        att_time_mix_k: ParamId::UNRESOLVED,
        att_time_mix_v: ParamId::UNRESOLVED,
        att_time_mix_r: ParamId::UNRESOLVED,
        att_time_first: ParamId::UNRESOLVED,
        att_time_decay: ParamId::UNRESOLVED,
        att_key: ParamId::UNRESOLVED,
        att_value: ParamId::UNRESOLVED,
        att_receptance: ParamId::UNRESOLVED,
        att_output: ParamId::UNRESOLVED,
        ln2_weight: ParamId::UNRESOLVED,
        ln2_bias: ParamId::UNRESOLVED,
        ffn_time_mix_k: ParamId::UNRESOLVED,
        ffn_time_mix_r: ParamId::UNRESOLVED,
        ffn_key: ParamId::UNRESOLVED,
        ffn_value: ParamId::UNRESOLVED,
        ffn_receptance: ParamId::UNRESOLVED,
    };
}

/// Global (non-layer) slots, filled by the schema resolver before [`Model`]
/// is assembled.
struct GlobalSlots {
    emb: ParamId,
    ln0_weight: ParamId,
    ln0_bias: ParamId,
    ln_out_weight: ParamId,
    ln_out_bias: ParamId,
    head: ParamId,
}

impl GlobalSlots {
    const UNRESOLVED: GlobalSlots = GlobalSlots {
        emb: ParamId::UNRESOLVED,
        ln0_weight: ParamId::UNRESOLVED,
        ln0_bias: ParamId::UNRESOLVED,
        ln_out_weight: ParamId::UNRESOLVED,
        ln_out_bias: ParamId::UNRESOLVED,
        head: ParamId::UNRESOLVED,
    };
}

/// How a parameter's payload participates in compute.
#[derive(Clone, Copy)]
enum ParamKind {
    /// Decoded to f32 at load; consumed element-wise.
    Vector,
    /// Kept in its stored type; consumed row-wise.
    Matrix,
}

/// Shape a schema row requires, in terms of the header dimensions.
#[derive(Clone, Copy)]
enum ShapeRule {
    /// `E` elements
    Embed,
    /// `E x E`
    Square,
    /// `E` wide, `V` tall
    EmbedByVocab,
    /// `E` wide, any height (the first layer's height defines `F`)
    UpProjection,
    /// `E` tall, any width (the feed-forward inner width)
    DownProjection,
}

/// One row of the parameter schema: name (or per-layer name suffix),
/// payload kind, shape rule, and the slot the resolved handle lands in.
struct SchemaEntry<T> {
    name: &'static str,
    kind: ParamKind,
    rule: ShapeRule,
    slot: fn(&mut T) -> &mut ParamId,
}

const GLOBAL_SCHEMA: [SchemaEntry<GlobalSlots>; 6] = [
    SchemaEntry {
        name: "emb.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::EmbedByVocab,
        slot: |g: &mut GlobalSlots| &mut g.emb,
    },
    SchemaEntry {
        name: "blocks.0.ln0.weight",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |g: &mut GlobalSlots| &mut g.ln0_weight,
    },
    SchemaEntry {
        name: "blocks.0.ln0.bias",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |g: &mut GlobalSlots| &mut g.ln0_bias,
    },
    SchemaEntry {
        name: "ln_out.weight",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |g: &mut GlobalSlots| &mut g.ln_out_weight,
    },
    SchemaEntry {
        name: "ln_out.bias",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |g: &mut GlobalSlots| &mut g.ln_out_bias,
    },
    SchemaEntry {
        name: "head.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::EmbedByVocab,
        slot: |g: &mut GlobalSlots| &mut g.head,
    },
];

/// Per-layer schema; `name` is the suffix after `blocks.{i}.`.
const LAYER_SCHEMA: [SchemaEntry<LayerWeights>; 18] = [
    SchemaEntry {
        name: "ln1.weight",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.ln1_weight,
    },
    SchemaEntry {
        name: "ln1.bias",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.ln1_bias,
    },
    SchemaEntry {
        name: "att.time_mix_k",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.att_time_mix_k,
    },
    SchemaEntry {
        name: "att.time_mix_v",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.att_time_mix_v,
    },
    SchemaEntry {
        name: "att.time_mix_r",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.att_time_mix_r,
    },
    SchemaEntry {
        name: "att.time_first",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.att_time_first,
    },
    SchemaEntry {
        name: "att.time_decay",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.att_time_decay,
    },
    SchemaEntry {
        name: "att.key.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::Square,
        slot: |l: &mut LayerWeights| &mut l.att_key,
    },
    SchemaEntry {
        name: "att.value.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::Square,
        slot: |l: &mut LayerWeights| &mut l.att_value,
    },
    SchemaEntry {
        name: "att.receptance.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::Square,
        slot: |l: &mut LayerWeights| &mut l.att_receptance,
    },
    SchemaEntry {
        name: "att.output.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::Square,
        slot: |l: &mut LayerWeights| &mut l.att_output,
    },
    SchemaEntry {
        name: "ln2.weight",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.ln2_weight,
    },
    SchemaEntry {
        name: "ln2.bias",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.ln2_bias,
    },
    SchemaEntry {
        name: "ffn.time_mix_k",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.ffn_time_mix_k,
    },
    SchemaEntry {
        name: "ffn.time_mix_r",
        kind: ParamKind::Vector,
        rule: ShapeRule::Embed,
        slot: |l: &mut LayerWeights| &mut l.ffn_time_mix_r,
    },
    SchemaEntry {
        name: "ffn.key.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::UpProjection,
        slot: |l: &mut LayerWeights| &mut l.ffn_key,
    },
    SchemaEntry {
        name: "ffn.value.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::DownProjection,
        slot: |l: &mut LayerWeights| &mut l.ffn_value,
    },
    SchemaEntry {
        name: "ffn.receptance.weight",
        kind: ParamKind::Matrix,
        rule: ShapeRule::Square,
        slot: |l: &mut LayerWeights| &mut l.ffn_receptance,
    },
];

/// Header dimensions the shape rules check against.
#[derive(Clone, Copy)]
struct Dims {
    n_embed: usize,
    n_vocab: usize,
}

fn check_shape(name: &str, rule: ShapeRule, dims: Dims, tensor: &Tensor) -> Result<()> {
    let expect = |expected: usize, actual: usize| -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(RecordarError::Dimension {
                name: name.to_string(),
                expected,
                actual,
            })
        }
    };

    match rule {
        ShapeRule::Embed => expect(dims.n_embed, tensor.element_count()),
        ShapeRule::Square => {
            expect(dims.n_embed, tensor.width())?;
            expect(dims.n_embed, tensor.height())
        }
        ShapeRule::EmbedByVocab => {
            expect(dims.n_embed, tensor.width())?;
            expect(dims.n_vocab, tensor.height())
        }
        ShapeRule::UpProjection => expect(dims.n_embed, tensor.width()),
        ShapeRule::DownProjection => expect(dims.n_embed, tensor.height()),
    }
}

/// A loaded model: header facts plus the resolved parameter tensors
#[derive(Debug)]
pub struct Model {
    n_vocab: usize,
    n_embed: usize,
    n_layer: usize,
    n_ffn: usize,
    data_type: TensorType,
    params: Vec<Tensor>,
    /// Token embedding matrix, `E x V`
    pub emb: ParamId,
    /// Input layer norm weight (applied once after embedding lookup)
    pub ln0_weight: ParamId,
    /// Input layer norm bias
    pub ln0_bias: ParamId,
    /// Per-layer weights
    pub layers: Vec<LayerWeights>,
    /// Output layer norm weight
    pub ln_out_weight: ParamId,
    /// Output layer norm bias
    pub ln_out_bias: ParamId,
    /// Output head matrix, `E x V`
    pub head: ParamId,
}

/// Takes tensors out of the loaded name map and interns them.
struct ParamTable {
    map: HashMap<Vec<u8>, Tensor>,
    params: Vec<Tensor>,
}

impl ParamTable {
    fn take(&mut self, name: &str) -> Result<Tensor> {
        self.map
            .remove(name.as_bytes())
            .ok_or_else(|| RecordarError::ParamMissing {
                name: name.to_string(),
            })
    }

    /// Resolve one schema row under `name` and store the handle in its slot.
    fn resolve<T>(
        &mut self,
        name: &str,
        entry: &SchemaEntry<T>,
        dims: Dims,
        target: &mut T,
    ) -> Result<()> {
        let tensor = self.take(name)?;
        check_shape(name, entry.rule, dims, &tensor)?;
        let tensor = match entry.kind {
            ParamKind::Vector => tensor.into_f32()?,
            ParamKind::Matrix => tensor,
        };
        self.params.push(tensor);
        *(entry.slot)(target) = ParamId(self.params.len() - 1);
        Ok(())
    }
}

impl Model {
    /// Resolve the parameter schema against tensors loaded from a file.
    ///
    /// One pass over the schema tables: every row is looked up in the map,
    /// shape-checked against the header, and assigned into its slot.
    ///
    /// # Errors
    ///
    /// `ParamMissing` for absent schema entries, `Dimension` when a tensor
    /// disagrees with the shape its row requires.
    pub fn from_parameters(
        header: &FileHeader,
        tensors: HashMap<Vec<u8>, Tensor>,
    ) -> Result<Self> {
        let dims = Dims {
            n_embed: header.n_embed as usize,
            n_vocab: header.n_vocab as usize,
        };
        let mut table = ParamTable {
            map: tensors,
            params: Vec::new(),
        };

        let mut globals = GlobalSlots::UNRESOLVED;
        for entry in &GLOBAL_SCHEMA {
            table.resolve(entry.name, entry, dims, &mut globals)?;
        }

        let n_layer = header.n_layer as usize;
        let mut layers = Vec::with_capacity(n_layer);
        for i in 0..n_layer {
            let mut layer = LayerWeights::UNRESOLVED;
            for entry in &LAYER_SCHEMA {
                let name = format!("blocks.{i}.{}", entry.name);
                table.resolve(&name, entry, dims, &mut layer)?;
            }
            layers.push(layer);
        }

        let params = table.params;

        let n_ffn = layers
            .first()
            .map(|layer| params[layer.ffn_key.0].height())
            .ok_or_else(|| RecordarError::ParamMissing {
                name: "blocks.0.ffn.key.weight".to_string(),
            })?;

        Ok(Self {
            n_vocab: dims.n_vocab,
            n_embed: dims.n_embed,
            n_layer,
            n_ffn,
            data_type: header.data_type,
            params,
            emb: globals.emb,
            ln0_weight: globals.ln0_weight,
            ln0_bias: globals.ln0_bias,
            layers,
            ln_out_weight: globals.ln_out_weight,
            ln_out_bias: globals.ln_out_bias,
            head: globals.head,
        })
    }

    /// Vocabulary size `V`.
    #[must_use]
    pub fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    /// Embedding width `E`.
    #[must_use]
    pub fn n_embed(&self) -> usize {
        self.n_embed
    }

    /// Layer count `L`.
    #[must_use]
    pub fn n_layer(&self) -> usize {
        self.n_layer
    }

    /// Feed-forward inner width `F`, discovered from the first layer's
    /// up-projection matrix.
    #[must_use]
    pub fn n_ffn(&self) -> usize {
        self.n_ffn
    }

    /// Data type declared in the file header.
    #[must_use]
    pub fn data_type(&self) -> TensorType {
        self.data_type
    }

    /// Resolve a parameter handle.
    #[must_use]
    pub fn param(&self, id: ParamId) -> &Tensor {
        &self.params[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FILE_VERSION;

    fn f32_payload(values: &[f32]) -> Vec<u8> {
        let mut payload = Vec::new();
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload
    }

    fn vector(n: usize) -> Tensor {
        Tensor::from_payload(TensorType::F32, n, 1, f32_payload(&vec![0.1f32; n])).unwrap()
    }

    fn matrix(width: usize, height: usize) -> Tensor {
        Tensor::from_payload(
            TensorType::F32,
            width,
            height,
            f32_payload(&vec![0.01f32; width * height]),
        )
        .unwrap()
    }

    fn tiny_tensor_map(
        n_vocab: usize,
        n_embed: usize,
        n_layer: usize,
        n_ffn: usize,
    ) -> HashMap<Vec<u8>, Tensor> {
        let mut map = HashMap::new();
        let mut put = |name: String, tensor: Tensor| {
            map.insert(name.into_bytes(), tensor);
        };

        put("emb.weight".to_string(), matrix(n_embed, n_vocab));
        put("blocks.0.ln0.weight".to_string(), vector(n_embed));
        put("blocks.0.ln0.bias".to_string(), vector(n_embed));
        for i in 0..n_layer {
            for suffix in [
                "ln1.weight",
                "ln1.bias",
                "att.time_mix_k",
                "att.time_mix_v",
                "att.time_mix_r",
                "att.time_first",
                "att.time_decay",
                "ln2.weight",
                "ln2.bias",
                "ffn.time_mix_k",
                "ffn.time_mix_r",
            ] {
                put(format!("blocks.{i}.{suffix}"), vector(n_embed));
            }
            for suffix in [
                "att.key.weight",
                "att.value.weight",
                "att.receptance.weight",
                "att.output.weight",
                "ffn.receptance.weight",
            ] {
                put(format!("blocks.{i}.{suffix}"), matrix(n_embed, n_embed));
            }
            put(format!("blocks.{i}.ffn.key.weight"), matrix(n_embed, n_ffn));
            put(format!("blocks.{i}.ffn.value.weight"), matrix(n_ffn, n_embed));
        }
        put("ln_out.weight".to_string(), vector(n_embed));
        put("ln_out.bias".to_string(), vector(n_embed));
        put("head.weight".to_string(), matrix(n_embed, n_vocab));
        map
    }

    fn header(n_vocab: u32, n_embed: u32, n_layer: u32) -> FileHeader {
        FileHeader {
            version: FILE_VERSION,
            n_vocab,
            n_embed,
            n_layer,
            data_type: TensorType::F32,
        }
    }

    #[test]
    fn test_schema_resolves() {
        let map = tiny_tensor_map(6, 4, 2, 8);
        let model = Model::from_parameters(&header(6, 4, 2), map).unwrap();
        assert_eq!(model.n_vocab(), 6);
        assert_eq!(model.n_embed(), 4);
        assert_eq!(model.n_layer(), 2);
        assert_eq!(model.n_ffn(), 8);
        assert_eq!(model.layers.len(), 2);

        // Spot-check resolved shapes through the handles.
        assert_eq!(model.param(model.emb).height(), 6);
        assert_eq!(model.param(model.head).width(), 4);
        let layer = &model.layers[1];
        assert_eq!(model.param(layer.att_key).width(), 4);
        assert_eq!(model.param(layer.att_key).height(), 4);
        assert_eq!(model.param(layer.ffn_key).height(), 8);
        assert_eq!(model.param(layer.ffn_value).width(), 8);
        assert_eq!(model.param(layer.ln1_weight).element_count(), 4);
    }

    #[test]
    fn test_schema_fills_every_slot() {
        // Each schema row must target a distinct slot, or some field would
        // be left at the placeholder.
        let map = tiny_tensor_map(6, 4, 1, 8);
        let model = Model::from_parameters(&header(6, 4, 1), map).unwrap();
        let layer = &model.layers[0];

        let ids = [
            model.emb,
            model.ln0_weight,
            model.ln0_bias,
            model.ln_out_weight,
            model.ln_out_bias,
            model.head,
            layer.ln1_weight,
            layer.ln1_bias,
            layer.att_time_mix_k,
            layer.att_time_mix_v,
            layer.att_time_mix_r,
            layer.att_time_first,
            layer.att_time_decay,
            layer.att_key,
            layer.att_value,
            layer.att_receptance,
            layer.att_output,
            layer.ln2_weight,
            layer.ln2_bias,
            layer.ffn_time_mix_k,
            layer.ffn_time_mix_r,
            layer.ffn_key,
            layer.ffn_value,
            layer.ffn_receptance,
        ];
        assert_eq!(ids.len(), GLOBAL_SCHEMA.len() + LAYER_SCHEMA.len());

        let mut raw: Vec<usize> = ids.iter().map(|id| id.0).collect();
        raw.sort_unstable();
        raw.dedup();
        assert_eq!(raw.len(), ids.len());
        assert!(ids.iter().all(|id| *id != ParamId::UNRESOLVED));
    }

    #[test]
    fn test_missing_parameter() {
        let mut map = tiny_tensor_map(6, 4, 1, 8);
        map.remove(b"blocks.0.att.time_decay".as_slice());
        let err = Model::from_parameters(&header(6, 4, 1), map).unwrap_err();
        match err {
            RecordarError::ParamMissing { name } => {
                assert_eq!(name, "blocks.0.att.time_decay");
            }
            other => panic!("expected ParamMissing, got {other}"),
        }
    }

    #[test]
    fn test_embedding_dimension_mismatch() {
        let mut map = tiny_tensor_map(6, 4, 1, 8);
        map.insert(b"emb.weight".to_vec(), matrix(4, 5)); // height != n_vocab
        let err = Model::from_parameters(&header(6, 4, 1), map).unwrap_err();
        assert!(matches!(err, RecordarError::Dimension { .. }));
    }

    #[test]
    fn test_vector_length_mismatch() {
        let mut map = tiny_tensor_map(6, 4, 1, 8);
        map.insert(b"blocks.0.ln1.weight".to_vec(), vector(5));
        let err = Model::from_parameters(&header(6, 4, 1), map).unwrap_err();
        match err {
            RecordarError::Dimension { name, expected, actual } => {
                assert_eq!(name, "blocks.0.ln1.weight");
                assert_eq!(expected, 4);
                assert_eq!(actual, 5);
            }
            other => panic!("expected Dimension, got {other}"),
        }
    }

    #[test]
    fn test_square_matrix_mismatch() {
        let mut map = tiny_tensor_map(6, 4, 1, 8);
        map.insert(b"blocks.0.att.key.weight".to_vec(), matrix(4, 3));
        let err = Model::from_parameters(&header(6, 4, 1), map).unwrap_err();
        assert!(matches!(err, RecordarError::Dimension { .. }));
    }
}
