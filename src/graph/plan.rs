//! Graph capacity planning
//!
//! The arena backing the computation graph is sized exactly, up front, so
//! building never allocates mid-flight. The tally is a pure data structure:
//! each budget function lists the nodes its subgraph allocates, line by
//! line, in the order the builder creates them. The builder and these
//! budgets must agree; `Graph::build` debug-asserts that they do, and the
//! arena turns any disagreement into a hard `Capacity` error.

/// Exact node and element capacity for a [`super::GraphArena`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphBudget {
    /// Node table entries, views included
    pub nodes: usize,
    /// Total f32 elements of node storage (views own none)
    pub elements: usize,
}

impl GraphBudget {
    /// One stored node of `len` elements.
    fn node(&mut self, len: usize) {
        self.nodes += 1;
        self.elements += len;
    }

    /// `count` stored nodes of `len` elements each.
    fn nodes(&mut self, count: usize, len: usize) {
        self.nodes += count;
        self.elements += count * len;
    }

    /// One view node; a window into an existing node, no storage.
    fn views(&mut self, count: usize) {
        self.nodes += count;
    }

    /// Add `count` copies of another budget.
    fn add(&mut self, count: usize, other: GraphBudget) {
        self.nodes += other.nodes * count;
        self.elements += other.elements * count;
    }
}

/// Nodes of one attention (time-mixing) subgraph.
#[must_use]
pub fn attention_budget(n_embed: usize) -> GraphBudget {
    let mut budget = GraphBudget::default();

    /*  x0 */ budget.node(n_embed);
    /*  xk */ budget.nodes(4, n_embed);
    /*  xv */ budget.nodes(4, n_embed);
    /*  xr */ budget.nodes(4, n_embed);

    /*   r */ budget.nodes(2, n_embed);
    /*   k */ budget.node(n_embed);
    /*   v */ budget.node(n_embed);

    /*  ww */ budget.node(n_embed);
    /*  qq */ budget.node(n_embed);
    /*  e1 */ budget.nodes(2, n_embed);
    /*  e2 */ budget.nodes(2, n_embed);
    /*   a */ budget.nodes(3, n_embed);
    /*   b */ budget.nodes(2, n_embed);
    /* wkv */ budget.node(n_embed);

    /* ww' */ budget.node(n_embed);
    /* qq' */ budget.node(n_embed);
    /* e1' */ budget.nodes(2, n_embed);
    /* e2' */ budget.nodes(2, n_embed);
    /* aa' */ budget.nodes(3, n_embed);
    /* bb' */ budget.nodes(2, n_embed);

    /* r*wkv */ budget.node(n_embed);
    /* out */ budget.nodes(2, n_embed);

    budget
}

/// Nodes of one feed-forward (channel-mixing) subgraph.
#[must_use]
pub fn feed_forward_budget(n_embed: usize, n_ffn: usize) -> GraphBudget {
    let mut budget = GraphBudget::default();

    /*  x0 */ budget.node(n_embed);
    /*  xk */ budget.nodes(4, n_embed);
    /*  xr */ budget.nodes(4, n_embed);

    /*   r */ budget.nodes(2, n_embed);
    /*   k */ budget.nodes(3, n_ffn);

    /* out */ budget.nodes(3, n_embed);

    budget
}

/// Full single-token graph budget.
#[must_use]
pub fn graph_budget(
    n_vocab: usize,
    n_embed: usize,
    n_layer: usize,
    n_ffn: usize,
) -> GraphBudget {
    let mut budget = GraphBudget::default();

    /*  state */ budget.node(n_layer * 5 * n_embed);
    /*  views */ budget.views(n_layer * 5);
    /*      x */ budget.node(n_embed);
    /*    ln0 */ budget.node(n_embed);

    /*    att */ budget.add(n_layer, attention_budget(n_embed));
    /*    ffn */ budget.add(n_layer, feed_forward_budget(n_embed, n_ffn));

    /* ln_out */ budget.node(n_embed);
    /* logits */ budget.node(n_vocab);

    budget
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attention_budget_scales_with_width() {
        let b = attention_budget(64);
        assert_eq!(b.nodes, 43);
        assert_eq!(b.elements, 43 * 64);
    }

    #[test]
    fn test_feed_forward_budget() {
        let b = feed_forward_budget(64, 256);
        assert_eq!(b.nodes, 17);
        assert_eq!(b.elements, 14 * 64 + 3 * 256);
    }

    #[test]
    fn test_graph_budget_composition() {
        let (v, e, l, f) = (256, 64, 3, 256);
        let b = graph_budget(v, e, l, f);
        assert_eq!(b.nodes, 5 + l * (5 + 43 + 17));
        assert_eq!(
            b.elements,
            l * 5 * e + 3 * e + l * (43 * e + 14 * e + 3 * f) + v
        );
    }
}
