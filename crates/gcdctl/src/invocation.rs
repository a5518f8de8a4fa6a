//! Command line of the spawned program.
//!
//! gcd understands `-c <file>` (load configuration), `--raw` (no machine
//! adaptation of G-code), `-C` (print configuration) and `--configtest`
//! (read commands from stdin). Values are opaque here and handed over verbatim.

use session::SessionBuilder;

use crate::config::GcdConfig;

/// A program and the arguments it is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
}

impl Invocation {
    /// Creates an invocation of `program` without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Builds the gcd command line described by `config`.
    ///
    /// The order matches what gcd expects: `-c` first so that later flags see
    /// the loaded configuration.
    pub fn gcd(config: &GcdConfig) -> Self {
        let mut invocation = Self::new(config.executable.clone());

        if !config.config_path.is_empty() {
            invocation = invocation.arg("-c").arg(config.config_path.clone());
        }
        if config.raw {
            invocation = invocation.arg("--raw");
        }
        if config.configtest {
            invocation = invocation.arg("--configtest");
        }

        invocation.args(config.extra_args.iter().cloned())
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Returns the program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Starts a session builder for this invocation.
    pub fn to_builder(&self) -> SessionBuilder {
        SessionBuilder::new(self.program.clone()).args(self.args.iter().cloned())
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
