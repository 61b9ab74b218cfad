use crate::TradeGoodSymbol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One export good and the imports its factory consumes to produce it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeRelation {
    pub export: TradeGoodSymbol,
    pub imports: Vec<TradeGoodSymbol>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupplyChain {
    pub relations: Vec<TradeRelation>,
}

impl SupplyChain {
    pub fn relation_map(&self) -> HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>> {
        self.relations
            .iter()
            .map(|relation| (relation.export.clone(), relation.imports.clone()))
            .collect()
    }
}

/// One node of a resolved input chain. `depth` is 0 for the product itself and
/// grows toward the raw leaves.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputChainNode {
    pub good: TradeGoodSymbol,
    pub inputs: Vec<TradeGoodSymbol>,
    pub depth: i32,
}

impl InputChainNode {
    pub fn is_leaf(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Depth-first expansion of a product's input map. Each good appears once at
/// its shallowest depth; the result is topologically usable because a node's
/// inputs always appear later in the list or are leaves.
pub fn resolve_input_chain(
    product: &TradeGoodSymbol,
    relations: &HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>>,
) -> Vec<InputChainNode> {
    fn walk(
        good: &TradeGoodSymbol,
        depth: i32,
        relations: &HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>>,
        seen: &mut HashMap<TradeGoodSymbol, usize>,
        result: &mut Vec<InputChainNode>,
    ) {
        if let Some(idx) = seen.get(good) {
            // keep the shallowest depth for goods reachable via two branches
            if result[*idx].depth > depth {
                result[*idx].depth = depth;
            }
            return;
        }
        let inputs = relations.get(good).cloned().unwrap_or_default();
        seen.insert(good.clone(), result.len());
        result.push(InputChainNode {
            good: good.clone(),
            inputs: inputs.clone(),
            depth,
        });
        for input in inputs {
            walk(&input, depth + 1, relations, seen, result);
        }
    }

    let mut seen = HashMap::new();
    let mut result = Vec::new();
    walk(product, 0, relations, &mut seen, &mut result);
    result
}

pub fn chain_depth(nodes: &[InputChainNode]) -> i32 {
    nodes.iter().map(|n| n.depth).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relations() -> HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>> {
        HashMap::from([
            ("FAB_MATS".into(), vec!["IRON".into(), "COPPER".into()]),
            ("IRON".into(), vec!["IRON_ORE".into()]),
        ])
    }

    #[test]
    fn resolves_nested_chain_with_depths() {
        let chain = resolve_input_chain(&"FAB_MATS".into(), &relations());
        let by_good: HashMap<_, _> = chain.iter().map(|n| (n.good.clone(), n)).collect();

        assert_eq!(by_good[&"FAB_MATS".into()].depth, 0);
        assert_eq!(by_good[&"IRON".into()].depth, 1);
        assert_eq!(by_good[&"COPPER".into()].depth, 1);
        assert_eq!(by_good[&"IRON_ORE".into()].depth, 2);
        assert!(by_good[&"COPPER".into()].is_leaf());
        assert!(by_good[&"IRON_ORE".into()].is_leaf());
        assert_eq!(chain_depth(&chain), 2);
    }

    #[test]
    fn unknown_product_is_a_single_leaf() {
        let chain = resolve_input_chain(&"QUARTZ_SAND".into(), &relations());
        assert_eq!(chain.len(), 1);
        assert!(chain[0].is_leaf());
        assert_eq!(chain_depth(&chain), 0);
    }

    #[test]
    fn shared_input_keeps_shallowest_depth() {
        let relations: HashMap<TradeGoodSymbol, Vec<TradeGoodSymbol>> = HashMap::from([
            ("SHIP_PLATING".into(), vec!["ALUMINUM".into(), "MACHINERY".into()]),
            ("MACHINERY".into(), vec!["ALUMINUM".into()]),
        ]);
        let chain = resolve_input_chain(&"SHIP_PLATING".into(), &relations);
        let aluminum = chain.iter().find(|n| n.good == "ALUMINUM".into()).unwrap();
        assert_eq!(aluminum.depth, 1);
    }
}
