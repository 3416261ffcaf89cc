//! Static cross-stage reference scan.
//!
//! The scan is lexical: it runs before argument expansion, so a `FROM
//! $BASE` or `COPY --from=$STAGE` records the unexpanded text. Callers must
//! treat the maps as an under-approximation of the real references.

use crate::options::is_builtin_build_arg;
use crate::stage::{BuildDefinition, StageDescriptor};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

const SCRATCH: &str = "scratch";

/// Names referenced across stages, gathered before any stage runs.
#[derive(Debug, Clone, Default)]
pub struct CrossReferences {
    base_images: HashSet<String>,
    rootfs_stages: HashSet<String>,
}

impl CrossReferences {
    /// Scans every stage's `FROM` and `COPY`/`ADD --from=` instructions.
    #[must_use]
    pub fn scan(stages: &[StageDescriptor]) -> Self {
        let mut refs = Self::default();
        for instruction in stages.iter().flat_map(StageDescriptor::instructions) {
            if instruction.is("FROM") {
                if let Some(base) = instruction.first_arg() {
                    if base != SCRATCH {
                        debug!(base = %base, "recorded base image");
                        refs.base_images.insert(base.to_string());
                    }
                }
            } else if instruction.is("ADD") || instruction.is("COPY") {
                for rootfs in instruction.flag_values("--from=") {
                    debug!(rootfs = %rootfs, "recorded referenced stage filesystem");
                    refs.rootfs_stages.insert(rootfs.to_string());
                }
            }
        }
        refs
    }

    /// Returns true if `name` appears literally as a base image.
    #[must_use]
    pub fn is_base_image(&self, name: &str) -> bool {
        self.base_images.contains(name)
    }

    /// Returns true if some stage copies files out of `name`.
    #[must_use]
    pub fn is_rootfs_referenced(&self, name: &str) -> bool {
        self.rootfs_stages.contains(name)
    }
}

/// Returns the supplied build arguments that no `ARG` instruction declares.
///
/// Conventional proxy arguments are never reported.
#[must_use]
pub fn unused_build_args(
    args: &BTreeMap<String, String>,
    definition: &BuildDefinition,
) -> BTreeSet<String> {
    let mut unused: BTreeSet<String> = args
        .keys()
        .filter(|name| !is_builtin_build_arg(name))
        .cloned()
        .collect();
    for declared in definition.declared_args() {
        unused.remove(declared);
    }
    unused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Instruction;

    fn stages() -> Vec<StageDescriptor> {
        vec![
            StageDescriptor::new(
                0,
                "builder",
                vec![
                    Instruction::new("FROM", ["golang:1.22", "AS", "builder"]),
                    Instruction::new("RUN", ["go build -o /out/app"]),
                ],
            ),
            StageDescriptor::unnamed(
                1,
                vec![
                    Instruction::new("FROM", ["scratch"]),
                    Instruction::new("COPY", ["/out/app", "/app"]).with_flag("--from=builder"),
                    Instruction::new("add", ["/etc/ssl", "/etc/ssl"]).with_flag("--from=$CERTS"),
                ],
            ),
        ]
    }

    #[test]
    fn test_scan_records_bases_and_rootfs() {
        let refs = CrossReferences::scan(&stages());

        assert!(refs.is_base_image("golang:1.22"));
        assert!(!refs.is_base_image("scratch"));
        assert!(refs.is_rootfs_referenced("builder"));
    }

    #[test]
    fn test_scan_does_not_expand_arguments() {
        let refs = CrossReferences::scan(&stages());
        assert!(refs.is_rootfs_referenced("$CERTS"));
        assert!(!refs.is_rootfs_referenced("certs"));
    }

    #[test]
    fn test_unused_build_args() {
        let definition = BuildDefinition::new(stages());
        let args = BTreeMap::from([
            ("FOO".to_string(), "bar".to_string()),
            ("HTTP_PROXY".to_string(), "http://proxy".to_string()),
        ]);
        let unused = unused_build_args(&args, &definition);
        assert_eq!(unused.into_iter().collect::<Vec<_>>(), vec!["FOO"]);
    }

    #[test]
    fn test_declared_args_are_consumed() {
        let definition = BuildDefinition::new(stages())
            .with_preamble(vec![Instruction::new("ARG", ["FOO=default"])]);
        let args = BTreeMap::from([("FOO".to_string(), "bar".to_string())]);
        assert!(unused_build_args(&args, &definition).is_empty());
    }
}
