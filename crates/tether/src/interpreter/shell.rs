//! A small line-command interpreter.
//!
//! One command per line, `#` starts a comment, `$name` expands a variable:
//!
//! ```text
//! print <text>            write a line to stdout
//! eprint <text>           write a line to stderr
//! put <text>              write text to stdout byte by byte, no newline
//! set <name> <text>       assign a variable
//! input <name> [prompt]   read a line from stdin into a variable
//! call <ns>.<fn> [args]   call a module function, result lands in `$_`
//! fail <kind> <message>   raise an error
//! ```
//!
//! Variables persist across runs of the same instance.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use futures::FutureExt;
use tether_types::{Object, Value};

use super::{
    InputSource, Interpreter, InterpreterError, InterpreterFactory, Module, NoInput, NullSink,
    OutputSink,
};

pub const SHELL_KIND: &str = "shell";
pub const SHELL_VERSION: &str = "1.0";

pub struct ShellInterpreter {
    version: String,
    vars: BTreeMap<String, String>,
    modules: HashMap<String, Module>,
    stdout: Box<dyn OutputSink>,
    stderr: Box<dyn OutputSink>,
    stdin: Box<dyn InputSource>,
}

impl ShellInterpreter {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            vars: BTreeMap::new(),
            modules: HashMap::new(),
            stdout: Box::new(NullSink),
            stderr: Box::new(NullSink),
            stdin: Box::new(NoInput),
        }
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    fn exec_line(&mut self, lineno: usize, raw: &str) -> Result<Option<Value>, InterpreterError> {
        let line = raw.trim_start();
        if line.trim().is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest),
            None => (line.trim_end(), ""),
        };
        let rest = self.expand(rest)?;

        match cmd {
            "print" => {
                self.stdout.write(&format!("{rest}\n")).map_err(io_error)?;
                Ok(None)
            }
            "eprint" => {
                self.stderr.write(&format!("{rest}\n")).map_err(io_error)?;
                Ok(None)
            }
            "put" => {
                for byte in rest.bytes() {
                    self.stdout.write_byte(byte).map_err(io_error)?;
                }
                Ok(None)
            }
            "set" => {
                let (name, value) = rest.split_once(' ').unwrap_or((rest.as_str(), ""));
                if name.is_empty() {
                    return Err(syntax(lineno, "set needs a variable name"));
                }
                self.vars.insert(name.to_string(), value.to_string());
                Ok(None)
            }
            "input" => {
                let (name, prompt) = match rest.split_once(' ') {
                    Some((name, prompt)) => (name, Some(prompt)),
                    None => (rest.trim_end(), None),
                };
                if name.is_empty() {
                    return Err(syntax(lineno, "input needs a variable name"));
                }
                self.stdout.flush().map_err(io_error)?;
                let line = self
                    .stdin
                    .read_line(prompt)
                    .map_err(io_error)?
                    .ok_or_else(|| InterpreterError::new("EOFError", "EOF when reading a line"))?;
                self.vars.insert(name.to_string(), line);
                Ok(None)
            }
            "call" => {
                let mut words = rest.split_whitespace();
                let path = words
                    .next()
                    .ok_or_else(|| syntax(lineno, "call needs a function"))?;
                let (namespace, name) = path
                    .split_once('.')
                    .ok_or_else(|| syntax(lineno, format!("expected <module>.<function>, got '{path}'")))?;
                let module = self
                    .modules
                    .get(namespace)
                    .ok_or_else(|| InterpreterError::new("NameError", format!("no module named '{namespace}'")))?;
                let func = module.function(name).ok_or_else(|| {
                    InterpreterError::new(
                        "AttributeError",
                        format!("module '{namespace}' has no function '{name}'"),
                    )
                })?;
                let args = words.map(parse_arg).collect();
                let value = func
                    .call(args)
                    .map_err(|e| InterpreterError::new("RuntimeError", e))?;
                self.vars.insert("_".to_string(), value.to_string());
                Ok(Some(value))
            }
            "fail" => {
                let (kind, message) = rest.split_once(' ').unwrap_or((rest.as_str(), ""));
                let kind = if kind.is_empty() { "Error" } else { kind };
                Err(InterpreterError::new(kind, message))
            }
            other => Err(syntax(lineno, format!("unknown command '{other}'"))),
        }
    }

    fn expand(&self, text: &str) -> Result<String, InterpreterError> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
                continue;
            }
            let value = self
                .vars
                .get(&name)
                .ok_or_else(|| InterpreterError::new("NameError", format!("name '{name}' is not defined")))?;
            out.push_str(value);
        }
        Ok(out)
    }
}

impl Interpreter for ShellInterpreter {
    fn kind(&self) -> &str {
        SHELL_KIND
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn run(&mut self, code: &str) -> Result<Value, InterpreterError> {
        let mut last = Value::Null;
        for (i, line) in code.lines().enumerate() {
            if let Some(value) = self.exec_line(i + 1, line)? {
                last = value;
            }
        }
        self.stdout.flush().map_err(io_error)?;
        self.stderr.flush().map_err(io_error)?;
        Ok(last)
    }

    fn run_async<'a>(&'a mut self, code: &'a str) -> BoxFuture<'a, Result<Value, InterpreterError>> {
        async move { self.run(code) }.boxed()
    }

    fn register_module(&mut self, namespace: &str, module: Module) {
        self.modules.insert(namespace.to_string(), module);
    }

    fn set_stdout(&mut self, sink: Box<dyn OutputSink>) {
        self.stdout = sink;
    }

    fn set_stderr(&mut self, sink: Box<dyn OutputSink>) {
        self.stderr = sink;
    }

    fn set_stdin(&mut self, source: Box<dyn InputSource>) {
        self.stdin = source;
    }
}

/// Factory for [`ShellInterpreter`]. A `vars` table in the worker config
/// seeds the variables.
pub struct ShellFactory;

impl InterpreterFactory for ShellFactory {
    fn kind(&self) -> &str {
        SHELL_KIND
    }

    fn create(&self, version: Option<&str>, config: &Value) -> Result<Box<dyn Interpreter>, InterpreterError> {
        let version = version.unwrap_or(SHELL_VERSION);
        if version != SHELL_VERSION {
            return Err(InterpreterError::new(
                "ValueError",
                format!("unsupported shell version {version}"),
            ));
        }
        let mut shell = ShellInterpreter::new(version);
        if let Some(Value::Object(vars)) = config.get("vars") {
            if let Object::Map(entries) = &*vars.read() {
                for (name, value) in entries {
                    shell.set_var(name.clone(), value.to_string());
                }
            }
        }
        Ok(Box::new(shell))
    }
}

fn parse_arg(word: &str) -> Value {
    if let Ok(n) = word.parse::<i64>() {
        return Value::Int(n);
    }
    match word {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::str(word),
    }
}

fn syntax(lineno: usize, message: impl Into<String>) -> InterpreterError {
    InterpreterError::new("SyntaxError", format!("line {lineno}: {}", message.into()))
}

fn io_error(e: std::io::Error) -> InterpreterError {
    InterpreterError::new("OSError", e.to_string())
}
