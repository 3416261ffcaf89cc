//! Stage and build definition fixtures.

use crate::stage::{BuildDefinition, Instruction, StageDescriptor};

/// An unnamed stage built `FROM base`.
#[must_use]
pub fn stage(position: usize, base: &str) -> StageDescriptor {
    StageDescriptor::unnamed(
        position,
        vec![
            Instruction::new("FROM", [base]),
            Instruction::new("RUN", ["true"]),
        ],
    )
}

/// A stage built `FROM base AS name`.
#[must_use]
pub fn named_stage(position: usize, name: &str, base: &str) -> StageDescriptor {
    StageDescriptor::new(
        position,
        name,
        vec![
            Instruction::new("FROM", [base, "AS", name]),
            Instruction::new("RUN", ["true"]),
        ],
    )
}

/// An unnamed stage that copies a file out of `from`.
#[must_use]
pub fn stage_copying_from(position: usize, base: &str, from: &str) -> StageDescriptor {
    StageDescriptor::unnamed(
        position,
        vec![
            Instruction::new("FROM", [base]),
            Instruction::new("COPY", ["/out", "/out"]).with_flag(format!("--from={from}")),
        ],
    )
}

/// An unnamed stage declaring `ARG arg`.
#[must_use]
pub fn stage_with_arg(position: usize, base: &str, arg: &str) -> StageDescriptor {
    StageDescriptor::unnamed(
        position,
        vec![
            Instruction::new("FROM", [base]),
            Instruction::new("ARG", [arg]),
            Instruction::new("RUN", ["true"]),
        ],
    )
}

/// `count` unnamed stages, each `FROM alpine`.
#[must_use]
pub fn independent_stages(count: usize) -> Vec<StageDescriptor> {
    (0..count).map(|position| stage(position, "alpine")).collect()
}

/// A build of `count` independent stages.
#[must_use]
pub fn independent_build(count: usize) -> BuildDefinition {
    BuildDefinition::new(independent_stages(count))
}
