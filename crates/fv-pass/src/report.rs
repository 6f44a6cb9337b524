//! Structured summary of one pass invocation.

use fv_core::{GraphId, IrError, Module, NodeId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DIGEST_NAMESPACE: &str = "fvx";

/// One expanded call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteReport {
    pub sweep: usize,
    pub vmap_node: NodeId,
    pub call_node: NodeId,
    /// Name of the closure the site maps over.
    pub closure: String,
    pub axis_size: usize,
    pub in_axes: String,
    /// The closure had other users and was cloned for this site.
    pub cloned: bool,
    pub primitives_rewritten: usize,
    /// Meta functions of inner vmaps that this site batched again.
    pub meta_ops_rewritten: usize,
    pub constants_wrapped: usize,
    pub free_variables_bound: usize,
    pub graphs_cloned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmapPassReport {
    pub sweeps: usize,
    pub sites: Vec<SiteReport>,
    /// Sites skipped because their closure still holds an inner vmap.
    pub deferred_sites: usize,
    pub unknown_options: Vec<String>,
    pub digest_before: String,
    pub digest_after: String,
}

impl VmapPassReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.sites.is_empty()
    }

    #[must_use]
    pub fn rewritten_primitives(&self) -> usize {
        self.sites.iter().map(|site| site.primitives_rewritten).sum()
    }

    /// Fold a later sweep into this report.
    pub fn absorb(&mut self, later: VmapPassReport) {
        self.sweeps += later.sweeps;
        self.sites.extend(later.sites);
        self.deferred_sites = later.deferred_sites;
        self.digest_after = later.digest_after;
    }
}

/// `fvx-<sha256>` over the fingerprints of `roots`, in order.
pub fn module_digest(module: &Module, roots: &[GraphId]) -> Result<String, IrError> {
    let mut hasher = Sha256::new();
    for root in roots {
        hasher.update(module.fingerprint(*root)?.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    Ok(format!("{DIGEST_NAMESPACE}-{}", bytes_to_hex(&digest)))
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{VmapPassReport, module_digest};
    use fv_core::{Module, Primitive};

    #[test]
    fn digest_is_stable_and_tracks_structure() {
        let mut module = Module::new();
        let graph = module.new_graph("f", None);
        let x = module.add_parameter(graph).expect("param");
        let neg = module
            .new_primitive_apply(graph, Primitive::Neg, &[x])
            .expect("neg");
        module.set_output(graph, neg).expect("output");

        let first = module_digest(&module, &[graph]).expect("digest");
        assert_eq!(first, module_digest(&module, &[graph]).expect("digest"));
        assert!(first.starts_with("fvx-"));
        assert_eq!(first.len(), 4 + 64);

        let exp = module
            .new_primitive_apply(graph, Primitive::Exp, &[neg])
            .expect("exp");
        module.set_output(graph, exp).expect("output");
        assert_ne!(first, module_digest(&module, &[graph]).expect("digest"));
    }

    #[test]
    fn absorb_accumulates_sweeps() {
        let mut report = VmapPassReport {
            sweeps: 1,
            sites: Vec::new(),
            deferred_sites: 1,
            unknown_options: Vec::new(),
            digest_before: "fvx-a".to_owned(),
            digest_after: "fvx-b".to_owned(),
        };
        report.absorb(VmapPassReport {
            sweeps: 1,
            sites: Vec::new(),
            deferred_sites: 0,
            unknown_options: Vec::new(),
            digest_before: "fvx-b".to_owned(),
            digest_after: "fvx-c".to_owned(),
        });
        assert_eq!(report.sweeps, 2);
        assert_eq!(report.deferred_sites, 0);
        assert_eq!(report.digest_before, "fvx-a");
        assert_eq!(report.digest_after, "fvx-c");
        assert!(!report.changed());
    }
}
