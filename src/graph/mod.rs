//! Static single-token computation graph
//!
//! The graph of one full forward step (embedding lookup, `L` RWKV blocks,
//! final norm, head projection) is wired once at context creation and only
//! re-executed afterwards. Node storage comes from a [`GraphArena`] sized by
//! the planner in [`plan`]; each step rewrites the token cell and the input
//! state, runs the op list in order, and leaves the logits plus the `L*5`
//! next-state parts in their nodes.
//!
//! The recurrence is numerically stabilized: the `att_pp` state slice
//! carries a per-channel running maximum of the exponent scale, and both
//! exponential groups subtract it before `exp`, so the accumulators never
//! overflow however long the stream runs.

mod arena;
mod kernels;
mod plan;

pub use arena::{GraphArena, NodeId};
pub use plan::{attention_budget, feed_forward_budget, graph_budget, GraphBudget};

use crate::error::{RecordarError, Result};
use crate::model::{LayerWeights, Model, ParamId};
use arena::Span;

/// Value fed into the `att_pp` state slices of a fresh state, standing in
/// for minus infinity in the running-maximum recurrence.
pub const FRESH_STATE_SENTINEL: f32 = -1e30;

/// State slices per layer (`ffn_xx`, `att_xx`, `att_aa`, `att_bb`, `att_pp`)
pub const STATE_PARTS_PER_LAYER: usize = 5;

/// Index of the `att_pp` slice within a layer's state parts
pub const ATT_PP_PART: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Source {
    Node(NodeId),
    Param(ParamId),
}

#[derive(Debug, Clone, Copy)]
enum UnaryKind {
    Exp,
    Sigmoid,
    OneMinus,
    Relu,
    Square,
}

#[derive(Debug, Clone, Copy)]
enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Max,
}

#[derive(Debug)]
enum Op {
    /// Decode the embedding row selected by the graph's token cell
    EmbeddingRow { matrix: ParamId, dst: NodeId },
    LayerNorm {
        src: NodeId,
        weight: ParamId,
        bias: ParamId,
        dst: NodeId,
    },
    Unary {
        kind: UnaryKind,
        src: Source,
        dst: NodeId,
    },
    Binary {
        kind: BinaryKind,
        a: Source,
        b: Source,
        dst: NodeId,
    },
    MatVec {
        weight: ParamId,
        src: NodeId,
        dst: NodeId,
    },
}

/// The wired single-token graph
#[derive(Debug)]
pub struct Graph {
    arena: GraphArena,
    ops: Vec<Op>,
    token: u32,
    input_state: NodeId,
    output_state: Vec<NodeId>,
    logits: NodeId,
}

/// The five state views of one layer, windows into the input-state node.
struct StateViews {
    ffn_xx: NodeId,
    att_xx: NodeId,
    att_aa: NodeId,
    att_bb: NodeId,
    att_pp: NodeId,
}

struct GraphBuilder<'m> {
    model: &'m Model,
    arena: GraphArena,
    ops: Vec<Op>,
}

impl<'m> GraphBuilder<'m> {
    fn source_len(&self, src: Source) -> usize {
        match src {
            Source::Node(id) => self.arena.len_of(id),
            Source::Param(id) => self.model.param(id).element_count(),
        }
    }

    /// A parameter consumed element-wise must be a decoded f32 vector.
    fn check_elementwise_param(&self, id: ParamId) -> Result<()> {
        if self.model.param(id).as_f32().is_none() {
            return Err(RecordarError::Graph {
                reason: "element-wise parameter is not stored as f32".to_string(),
            });
        }
        Ok(())
    }

    fn check_source(&self, src: Source) -> Result<()> {
        if let Source::Param(id) = src {
            self.check_elementwise_param(id)?;
        }
        Ok(())
    }

    fn unary(&mut self, kind: UnaryKind, src: Source) -> Result<NodeId> {
        self.check_source(src)?;
        let dst = self.arena.alloc(self.source_len(src))?;
        self.ops.push(Op::Unary { kind, src, dst });
        Ok(dst)
    }

    fn binary(&mut self, kind: BinaryKind, a: Source, b: Source) -> Result<NodeId> {
        self.check_source(a)?;
        self.check_source(b)?;
        let len = self.source_len(a);
        if self.source_len(b) != len {
            return Err(RecordarError::Graph {
                reason: format!(
                    "element-wise operands of length {len} and {} cannot combine",
                    self.source_len(b)
                ),
            });
        }
        let dst = self.arena.alloc(len)?;
        self.ops.push(Op::Binary { kind, a, b, dst });
        Ok(dst)
    }

    fn layer_norm(&mut self, src: NodeId, weight: ParamId, bias: ParamId) -> Result<NodeId> {
        let len = self.arena.len_of(src);
        for id in [weight, bias] {
            self.check_elementwise_param(id)?;
            if self.model.param(id).element_count() != len {
                return Err(RecordarError::Graph {
                    reason: format!(
                        "layer norm affine parameters do not match a {len} element input"
                    ),
                });
            }
        }
        let dst = self.arena.alloc(len)?;
        self.ops.push(Op::LayerNorm {
            src,
            weight,
            bias,
            dst,
        });
        Ok(dst)
    }

    fn matvec(&mut self, weight: ParamId, src: NodeId) -> Result<NodeId> {
        let w = self.model.param(weight);
        if w.width() != self.arena.len_of(src) {
            return Err(RecordarError::Graph {
                reason: format!(
                    "matrix of width {} cannot multiply a {} element vector",
                    w.width(),
                    self.arena.len_of(src)
                ),
            });
        }
        let dst = self.arena.alloc(w.height())?;
        self.ops.push(Op::MatVec { weight, src, dst });
        Ok(dst)
    }

    fn embedding_row(&mut self, matrix: ParamId) -> Result<NodeId> {
        let dst = self.arena.alloc(self.model.param(matrix).width())?;
        self.ops.push(Op::EmbeddingRow { matrix, dst });
        Ok(dst)
    }

    /// `x0 * coeff + prev * (1 - coeff)`, the time-mixing interpolation.
    fn mix(&mut self, x0: NodeId, prev: NodeId, coeff: ParamId) -> Result<NodeId> {
        let inverse = self.unary(UnaryKind::OneMinus, Source::Param(coeff))?;
        let current = self.binary(BinaryKind::Mul, Source::Node(x0), Source::Param(coeff))?;
        let carried = self.binary(BinaryKind::Mul, Source::Node(prev), Source::Node(inverse))?;
        self.binary(BinaryKind::Add, Source::Node(current), Source::Node(carried))
    }

    /// Time-mixing sub-block. Returns the layer output and the four state
    /// parts it owns (`att_xx`, `att_aa`, `att_bb`, `att_pp`).
    fn attention(
        &mut self,
        x: NodeId,
        layer: &LayerWeights,
        state: &StateViews,
    ) -> Result<(NodeId, [NodeId; 4])> {
        let x0 = self.layer_norm(x, layer.ln1_weight, layer.ln1_bias)?;

        let xk = self.mix(x0, state.att_xx, layer.att_time_mix_k)?;
        let xv = self.mix(x0, state.att_xx, layer.att_time_mix_v)?;
        let xr = self.mix(x0, state.att_xx, layer.att_time_mix_r)?;

        let r_lin = self.matvec(layer.att_receptance, xr)?;
        let r = self.unary(UnaryKind::Sigmoid, Source::Node(r_lin))?;
        let k = self.matvec(layer.att_key, xk)?;
        let v = self.matvec(layer.att_value, xv)?;

        // Output half of the recurrence: combine the carried accumulators
        // with the current token under a shared exponent offset.
        let ww = self.binary(
            BinaryKind::Add,
            Source::Param(layer.att_time_first),
            Source::Node(k),
        )?;
        let qq = self.binary(
            BinaryKind::Max,
            Source::Node(state.att_pp),
            Source::Node(ww),
        )?;
        let e1 = {
            let shifted = self.binary(
                BinaryKind::Sub,
                Source::Node(state.att_pp),
                Source::Node(qq),
            )?;
            self.unary(UnaryKind::Exp, Source::Node(shifted))?
        };
        let e2 = {
            let shifted = self.binary(BinaryKind::Sub, Source::Node(ww), Source::Node(qq))?;
            self.unary(UnaryKind::Exp, Source::Node(shifted))?
        };

        let a = {
            let carried = self.binary(
                BinaryKind::Mul,
                Source::Node(e1),
                Source::Node(state.att_aa),
            )?;
            let current = self.binary(BinaryKind::Mul, Source::Node(e2), Source::Node(v))?;
            self.binary(BinaryKind::Add, Source::Node(carried), Source::Node(current))?
        };
        let b = {
            let carried = self.binary(
                BinaryKind::Mul,
                Source::Node(e1),
                Source::Node(state.att_bb),
            )?;
            self.binary(BinaryKind::Add, Source::Node(carried), Source::Node(e2))?
        };
        let wkv = self.binary(BinaryKind::Div, Source::Node(a), Source::Node(b))?;

        // State half: fold the current key into the accumulators for the
        // next token, under a freshly tightened offset.
        let ww_next = self.binary(
            BinaryKind::Add,
            Source::Node(state.att_pp),
            Source::Param(layer.att_time_decay),
        )?;
        let qq_next = self.binary(BinaryKind::Max, Source::Node(ww_next), Source::Node(k))?;
        let e1_next = {
            let shifted = self.binary(
                BinaryKind::Sub,
                Source::Node(ww_next),
                Source::Node(qq_next),
            )?;
            self.unary(UnaryKind::Exp, Source::Node(shifted))?
        };
        let e2_next = {
            let shifted = self.binary(BinaryKind::Sub, Source::Node(k), Source::Node(qq_next))?;
            self.unary(UnaryKind::Exp, Source::Node(shifted))?
        };

        let aa_next = {
            let carried = self.binary(
                BinaryKind::Mul,
                Source::Node(e1_next),
                Source::Node(state.att_aa),
            )?;
            let current = self.binary(BinaryKind::Mul, Source::Node(e2_next), Source::Node(v))?;
            self.binary(BinaryKind::Add, Source::Node(carried), Source::Node(current))?
        };
        let bb_next = {
            let carried = self.binary(
                BinaryKind::Mul,
                Source::Node(e1_next),
                Source::Node(state.att_bb),
            )?;
            self.binary(BinaryKind::Add, Source::Node(carried), Source::Node(e2_next))?
        };

        let gated = self.binary(BinaryKind::Mul, Source::Node(r), Source::Node(wkv))?;
        let projected = self.matvec(layer.att_output, gated)?;
        let out = self.binary(BinaryKind::Add, Source::Node(x), Source::Node(projected))?;

        Ok((out, [x0, aa_next, bb_next, qq_next]))
    }

    /// Channel-mixing sub-block. Returns the layer output and the new
    /// `ffn_xx` state part.
    fn feed_forward(
        &mut self,
        x: NodeId,
        layer: &LayerWeights,
        state: &StateViews,
    ) -> Result<(NodeId, NodeId)> {
        let x0 = self.layer_norm(x, layer.ln2_weight, layer.ln2_bias)?;

        let xk = self.mix(x0, state.ffn_xx, layer.ffn_time_mix_k)?;
        let xr = self.mix(x0, state.ffn_xx, layer.ffn_time_mix_r)?;

        let r_lin = self.matvec(layer.ffn_receptance, xr)?;
        let r = self.unary(UnaryKind::Sigmoid, Source::Node(r_lin))?;

        let k_lin = self.matvec(layer.ffn_key, xk)?;
        let k_pos = self.unary(UnaryKind::Relu, Source::Node(k_lin))?;
        let k = self.unary(UnaryKind::Square, Source::Node(k_pos))?;

        let down = self.matvec(layer.ffn_value, k)?;
        let gated = self.binary(BinaryKind::Mul, Source::Node(r), Source::Node(down))?;
        let out = self.binary(BinaryKind::Add, Source::Node(x), Source::Node(gated))?;

        Ok((out, x0))
    }
}

impl Graph {
    /// Wire the full graph for `model`.
    ///
    /// # Errors
    ///
    /// `Graph` or `Dimension` when parameter shapes do not line up;
    /// `Capacity` if the planner and builder disagree (a bug, surfaced hard).
    pub fn build(model: &Model) -> Result<Self> {
        let n_embed = model.n_embed();
        let n_layer = model.n_layer();

        let budget = graph_budget(model.n_vocab(), n_embed, n_layer, model.n_ffn());
        let mut builder = GraphBuilder {
            model,
            arena: GraphArena::with_budget(budget),
            ops: Vec::new(),
        };

        let input_state = builder
            .arena
            .alloc(n_layer * STATE_PARTS_PER_LAYER * n_embed)?;
        let mut output_state = Vec::with_capacity(n_layer * STATE_PARTS_PER_LAYER);

        let embedded = builder.embedding_row(model.emb)?;
        let mut x = builder.layer_norm(embedded, model.ln0_weight, model.ln0_bias)?;

        for (i, layer) in model.layers.iter().enumerate() {
            let base = i * STATE_PARTS_PER_LAYER * n_embed;
            let view = |builder: &mut GraphBuilder<'_>, part: usize| {
                builder
                    .arena
                    .view(input_state, base + part * n_embed, n_embed)
            };
            let state = StateViews {
                ffn_xx: view(&mut builder, 0)?,
                att_xx: view(&mut builder, 1)?,
                att_aa: view(&mut builder, 2)?,
                att_bb: view(&mut builder, 3)?,
                att_pp: view(&mut builder, ATT_PP_PART)?,
            };

            let (after_att, [att_xx, att_aa, att_bb, att_pp]) =
                builder.attention(x, layer, &state)?;
            let (after_ffn, ffn_xx) = builder.feed_forward(after_att, layer, &state)?;
            x = after_ffn;

            output_state.push(ffn_xx);
            output_state.push(att_xx);
            output_state.push(att_aa);
            output_state.push(att_bb);
            output_state.push(att_pp);
        }

        let normed = builder.layer_norm(x, model.ln_out_weight, model.ln_out_bias)?;
        let logits = builder.matvec(model.head, normed)?;

        debug_assert_eq!(builder.arena.node_count(), budget.nodes);
        debug_assert_eq!(builder.arena.used_elements(), budget.elements);

        Ok(Self {
            arena: builder.arena,
            ops: builder.ops,
            token: 0,
            input_state,
            output_state,
            logits,
        })
    }

    /// Select the token the next execution embeds.
    pub fn set_token(&mut self, token: u32) {
        self.token = token;
    }

    /// The input-state node, for the evaluator to fill before a step.
    pub fn input_state_mut(&mut self) -> &mut [f32] {
        self.arena.slice_mut(self.input_state)
    }

    /// Logits produced by the last execution.
    #[must_use]
    pub fn logits(&self) -> &[f32] {
        self.arena.slice(self.logits)
    }

    /// Number of output state parts (`L * 5`).
    #[must_use]
    pub fn state_part_count(&self) -> usize {
        self.output_state.len()
    }

    /// Output state part `index`, in per-layer slice order.
    #[must_use]
    pub fn state_part(&self, index: usize) -> &[f32] {
        self.arena.slice(self.output_state[index])
    }

    /// Run every op in wiring order.
    ///
    /// # Errors
    ///
    /// `Shape` if the token cell is outside the embedding matrix (the
    /// evaluator checks this earlier) or a parameter decodes inconsistently.
    pub fn execute(&mut self, model: &Model) -> Result<()> {
        let token = self.token as usize;
        let arena = &mut self.arena;

        for op in &self.ops {
            match *op {
                Op::EmbeddingRow { matrix, dst } => {
                    let (_, _, out) = arena.split_for(dst);
                    model.param(matrix).read_row(token, out)?;
                }
                Op::LayerNorm {
                    src,
                    weight,
                    bias,
                    dst,
                } => {
                    let (lo, spans, out) = arena.split_for(dst);
                    let input = node_slice(lo, spans, src);
                    kernels::layer_norm(
                        out,
                        input,
                        param_f32(model, weight)?,
                        param_f32(model, bias)?,
                    );
                }
                Op::Unary { kind, src, dst } => {
                    let (lo, spans, out) = arena.split_for(dst);
                    let input = source_slice(model, lo, spans, src)?;
                    match kind {
                        UnaryKind::Exp => kernels::exp(out, input),
                        UnaryKind::Sigmoid => kernels::sigmoid(out, input),
                        UnaryKind::OneMinus => kernels::one_minus(out, input),
                        UnaryKind::Relu => kernels::relu(out, input),
                        UnaryKind::Square => kernels::square(out, input),
                    }
                }
                Op::Binary { kind, a, b, dst } => {
                    let (lo, spans, out) = arena.split_for(dst);
                    let lhs = source_slice(model, lo, spans, a)?;
                    let rhs = source_slice(model, lo, spans, b)?;
                    match kind {
                        BinaryKind::Add => kernels::add(out, lhs, rhs),
                        BinaryKind::Sub => kernels::sub(out, lhs, rhs),
                        BinaryKind::Mul => kernels::mul(out, lhs, rhs),
                        BinaryKind::Div => kernels::div(out, lhs, rhs),
                        BinaryKind::Max => kernels::max(out, lhs, rhs),
                    }
                }
                Op::MatVec { weight, src, dst } => {
                    let (lo, spans, out) = arena.split_for(dst);
                    let input = node_slice(lo, spans, src);
                    kernels::matvec(model.param(weight), input, out);
                }
            }
        }
        Ok(())
    }
}

fn node_slice<'a>(lo: &'a [f32], spans: &[Span], id: NodeId) -> &'a [f32] {
    let span = spans[id.0];
    &lo[span.offset..span.offset + span.len]
}

fn param_f32(model: &Model, id: ParamId) -> Result<&[f32]> {
    model.param(id).as_f32().ok_or_else(|| RecordarError::Graph {
        reason: "element-wise parameter is not stored as f32".to_string(),
    })
}

fn source_slice<'a>(
    model: &'a Model,
    lo: &'a [f32],
    spans: &[Span],
    src: Source,
) -> Result<&'a [f32]> {
    match src {
        Source::Node(id) => Ok(node_slice(lo, spans, id)),
        Source::Param(id) => param_f32(model, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FileHeader, TensorType, FILE_VERSION};
    use crate::tensor::Tensor;
    use std::collections::HashMap;

    /// Deterministic weights: a small multiplicative generator keeps the
    /// fixture reproducible without a random-number dependency.
    struct Lcg(u64);

    impl Lcg {
        fn next_f32(&mut self) -> f32 {
            self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((self.0 >> 33) as f32 / (1u64 << 31) as f32) - 0.5
        }

        fn vector(&mut self, n: usize, scale: f32) -> Tensor {
            Tensor::from_f32((0..n).map(|_| self.next_f32() * scale).collect())
        }

        fn matrix(&mut self, width: usize, height: usize, scale: f32) -> Tensor {
            let mut payload = Vec::with_capacity(width * height * 4);
            for _ in 0..width * height {
                payload.extend_from_slice(&(self.next_f32() * scale).to_le_bytes());
            }
            Tensor::from_payload(TensorType::F32, width, height, payload).unwrap()
        }
    }

    fn tiny_model(n_vocab: usize, n_embed: usize, n_layer: usize, n_ffn: usize) -> Model {
        let mut rng = Lcg(42);
        let mut map = HashMap::new();
        let mut put = |name: String, tensor: Tensor| {
            map.insert(name.into_bytes(), tensor);
        };

        put(
            "emb.weight".to_string(),
            rng.matrix(n_embed, n_vocab, 0.4),
        );
        put("blocks.0.ln0.weight".to_string(), rng.vector(n_embed, 1.0));
        put("blocks.0.ln0.bias".to_string(), rng.vector(n_embed, 0.1));
        for i in 0..n_layer {
            for suffix in ["ln1.weight", "ln2.weight"] {
                put(format!("blocks.{i}.{suffix}"), rng.vector(n_embed, 1.0));
            }
            for suffix in ["ln1.bias", "ln2.bias"] {
                put(format!("blocks.{i}.{suffix}"), rng.vector(n_embed, 0.1));
            }
            for suffix in [
                "att.time_mix_k",
                "att.time_mix_v",
                "att.time_mix_r",
                "ffn.time_mix_k",
                "ffn.time_mix_r",
            ] {
                // Mixing coefficients sit in (0, 1).
                let values: Vec<f32> = (0..n_embed)
                    .map(|_| rng.next_f32().abs().min(0.95))
                    .collect();
                put(format!("blocks.{i}.{suffix}"), Tensor::from_f32(values));
            }
            put(
                format!("blocks.{i}.att.time_first"),
                rng.vector(n_embed, 0.5),
            );
            put(
                format!("blocks.{i}.att.time_decay"),
                Tensor::from_f32((0..n_embed).map(|_| -rng.next_f32().abs() - 0.1).collect()),
            );
            for suffix in [
                "att.key.weight",
                "att.value.weight",
                "att.receptance.weight",
                "att.output.weight",
                "ffn.receptance.weight",
            ] {
                put(
                    format!("blocks.{i}.{suffix}"),
                    rng.matrix(n_embed, n_embed, 0.3),
                );
            }
            put(
                format!("blocks.{i}.ffn.key.weight"),
                rng.matrix(n_embed, n_ffn, 0.3),
            );
            put(
                format!("blocks.{i}.ffn.value.weight"),
                rng.matrix(n_ffn, n_embed, 0.3),
            );
        }
        put("ln_out.weight".to_string(), rng.vector(n_embed, 1.0));
        put("ln_out.bias".to_string(), rng.vector(n_embed, 0.1));
        put("head.weight".to_string(), rng.matrix(n_embed, n_vocab, 0.4));

        let header = FileHeader {
            version: FILE_VERSION,
            n_vocab: n_vocab as u32,
            n_embed: n_embed as u32,
            n_layer: n_layer as u32,
            data_type: TensorType::F32,
        };
        Model::from_parameters(&header, map).unwrap()
    }

    fn fresh_state(graph: &mut Graph, n_layer: usize, n_embed: usize) {
        let state = graph.input_state_mut();
        state.fill(0.0);
        for layer in 0..n_layer {
            let start = n_embed * (layer * STATE_PARTS_PER_LAYER + ATT_PP_PART);
            state[start..start + n_embed].fill(FRESH_STATE_SENTINEL);
        }
    }

    #[test]
    fn test_build_matches_plan() {
        // The debug assertions in build() compare the builder's actual
        // consumption against the planner; several shapes exercise both
        // the E- and F-dependent terms.
        for (v, e, l, f) in [(16, 8, 1, 16), (32, 12, 3, 20), (8, 4, 2, 4)] {
            let model = tiny_model(v, e, l, f);
            let graph = Graph::build(&model).unwrap();
            let budget = graph_budget(v, e, l, f);
            assert_eq!(graph.arena.node_count(), budget.nodes);
            assert_eq!(graph.arena.used_elements(), budget.elements);
        }
    }

    #[test]
    fn test_execute_is_deterministic() {
        let (v, e, l, f) = (16, 8, 2, 16);
        let model = tiny_model(v, e, l, f);
        let mut graph = Graph::build(&model).unwrap();

        let mut run = |token: u32| -> (Vec<f32>, Vec<f32>) {
            fresh_state(&mut graph, l, e);
            graph.set_token(token);
            graph.execute(&model).unwrap();
            let state: Vec<f32> = (0..graph.state_part_count())
                .flat_map(|i| graph.state_part(i).to_vec())
                .collect();
            (graph.logits().to_vec(), state)
        };

        let (logits_a, state_a) = run(3);
        let (logits_b, state_b) = run(3);
        assert_eq!(logits_a, logits_b);
        assert_eq!(state_a, state_b);

        let (logits_c, _) = run(4);
        assert_ne!(logits_a, logits_c);
    }

    #[test]
    fn test_outputs_are_finite_from_fresh_state() {
        let (v, e, l, f) = (16, 8, 2, 16);
        let model = tiny_model(v, e, l, f);
        let mut graph = Graph::build(&model).unwrap();

        fresh_state(&mut graph, l, e);
        graph.set_token(0);
        graph.execute(&model).unwrap();

        assert_eq!(graph.logits().len(), v);
        assert!(graph.logits().iter().all(|x| x.is_finite()));
        for i in 0..graph.state_part_count() {
            assert_eq!(graph.state_part(i).len(), e);
            assert!(graph.state_part(i).iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn test_state_feedback_changes_outputs() {
        // Feeding the produced state back in must influence the next step;
        // that is the whole point of the recurrence.
        let (v, e, l, f) = (16, 8, 2, 16);
        let model = tiny_model(v, e, l, f);
        let mut graph = Graph::build(&model).unwrap();

        fresh_state(&mut graph, l, e);
        graph.set_token(1);
        graph.execute(&model).unwrap();
        let carried: Vec<f32> = (0..graph.state_part_count())
            .flat_map(|i| graph.state_part(i).to_vec())
            .collect();
        let logits_fresh_then_1: Vec<f32> = graph.logits().to_vec();

        // Same token from a fresh state...
        fresh_state(&mut graph, l, e);
        graph.set_token(2);
        graph.execute(&model).unwrap();
        let logits_fresh_then_2 = graph.logits().to_vec();

        // ...versus from the carried state.
        graph.input_state_mut().copy_from_slice(&carried);
        graph.set_token(2);
        graph.execute(&model).unwrap();
        let logits_carried_then_2 = graph.logits().to_vec();

        assert_ne!(logits_fresh_then_2, logits_carried_then_2);
        assert_ne!(logits_fresh_then_1, logits_carried_then_2);
    }

    #[test]
    fn test_stabilized_recurrence_survives_long_streams() {
        // Without the running-max offset the accumulators overflow after a
        // few dozen tokens; with it a few hundred steps stay finite.
        let (v, e, l, f) = (16, 8, 1, 16);
        let model = tiny_model(v, e, l, f);
        let mut graph = Graph::build(&model).unwrap();

        fresh_state(&mut graph, l, e);
        for step in 0..300u32 {
            graph.set_token(step % v as u32);
            graph.execute(&model).unwrap();
            let state: Vec<f32> = (0..graph.state_part_count())
                .flat_map(|i| graph.state_part(i).to_vec())
                .collect();
            assert!(
                state.iter().all(|x| x.is_finite()),
                "state went non-finite at step {step}"
            );
            graph.input_state_mut().copy_from_slice(&state);
        }
        assert!(graph.logits().iter().all(|x| x.is_finite()));
    }
}
