//! Parsed stage descriptors.
//!
//! The parser that turns build-description text into these types lives
//! outside this crate; the coordinator only inspects instruction keywords,
//! arguments and flags lexically.

use crate::errors::BuildError;
use serde::{Deserialize, Serialize};

/// One instruction line of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// The instruction keyword, e.g. `FROM` or `COPY`.
    pub keyword: String,
    /// Positional arguments following the keyword.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flags such as `--from=builder`.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl Instruction {
    /// Creates a new instruction.
    #[must_use]
    pub fn new(
        keyword: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            keyword: keyword.into(),
            args: args.into_iter().map(Into::into).collect(),
            flags: Vec::new(),
        }
    }

    /// Adds a flag.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Returns true if the keyword matches, ignoring case.
    #[must_use]
    pub fn is(&self, keyword: &str) -> bool {
        self.keyword.eq_ignore_ascii_case(keyword)
    }

    /// Returns the first positional argument.
    #[must_use]
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Returns the values of every flag starting with `prefix`.
    pub fn flag_values<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.flags.iter().filter_map(move |flag| flag.strip_prefix(prefix))
    }

    /// Returns the argument name declared by an `ARG` instruction.
    ///
    /// The argument is either `NAME` or `NAME=default`.
    #[must_use]
    pub fn declared_arg(&self) -> Option<&str> {
        if !self.is("ARG") {
            return None;
        }
        self.first_arg()
            .map(|arg| arg.split_once('=').map_or(arg, |(name, _)| name))
    }
}

/// One parsed build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    position: usize,
    name: String,
    instructions: Vec<Instruction>,
}

impl StageDescriptor {
    /// Creates a stage with an explicit name.
    #[must_use]
    pub fn new(position: usize, name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            position,
            name: name.into(),
            instructions,
        }
    }

    /// Creates a stage named after its position.
    #[must_use]
    pub fn unnamed(position: usize, instructions: Vec<Instruction>) -> Self {
        Self::new(position, position.to_string(), instructions)
    }

    /// Returns the zero-based position of the stage.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the stage name: its alias, or its stringified position.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stringified position.
    #[must_use]
    pub fn position_key(&self) -> String {
        self.position.to_string()
    }

    /// Returns true if the stage has an alias distinct from its position.
    #[must_use]
    pub fn has_alias(&self) -> bool {
        self.name != self.position_key()
    }

    /// Returns the stage's instructions.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns the base image named by the stage's `FROM` instruction.
    pub fn base_image(&self) -> Result<String, BuildError> {
        self.instructions
            .iter()
            .find(|instruction| instruction.is("FROM"))
            .and_then(Instruction::first_arg)
            .map(str::to_string)
            .ok_or_else(|| BuildError::MissingBase {
                stage: self.name.clone(),
            })
    }
}

/// A complete build: instructions before the first stage plus the stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDefinition {
    /// Instructions appearing before the first `FROM` (global `ARG`s).
    #[serde(default)]
    pub preamble: Vec<Instruction>,
    /// The stages, in declaration order.
    pub stages: Vec<StageDescriptor>,
}

impl BuildDefinition {
    /// Creates a definition from stages.
    #[must_use]
    pub fn new(stages: Vec<StageDescriptor>) -> Self {
        Self {
            preamble: Vec::new(),
            stages,
        }
    }

    /// Sets the preamble.
    #[must_use]
    pub fn with_preamble(mut self, preamble: Vec<Instruction>) -> Self {
        self.preamble = preamble;
        self
    }

    /// Returns the stages.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Checks that the definition has stages and that their positions run `0..N` in order.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.stages.is_empty() {
            return Err(BuildError::NoStages);
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.position() != index {
                return Err(BuildError::StagePosition {
                    stage: stage.name().to_string(),
                    index,
                    position: stage.position(),
                });
            }
        }
        Ok(())
    }

    /// Returns every argument name declared by an `ARG` instruction anywhere.
    pub fn declared_args(&self) -> impl Iterator<Item = &str> {
        self.preamble
            .iter()
            .chain(self.stages.iter().flat_map(|stage| stage.instructions.iter()))
            .filter_map(Instruction::declared_arg)
    }
}
