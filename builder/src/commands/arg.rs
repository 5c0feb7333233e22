//! `ARG`: declare a build argument.

use a3s_build_core::error::Result;

use super::{CacheState, Instruction};
use crate::args::BuildArgs;
use crate::image::ImageConfig;

pub struct ArgCommand {
    name: String,
    default: Option<String>,
    cache: CacheState,
}

impl ArgCommand {
    pub fn new(name: String, default: Option<String>) -> Self {
        Self {
            name,
            default,
            cache: CacheState::new(),
        }
    }
}

impl Instruction for ArgCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        let default = match self.default {
            Some(ref d) => Some(args.substitute(d, &config.env)?),
            None => None,
        };
        args.declare(&self.name, default)
    }

    fn describe(&self) -> String {
        match self.default {
            Some(ref d) => format!("ARG {}={}", self.name, d),
            None => format!("ARG {}", self.name),
        }
    }

    cache_state_accessors!();
}
