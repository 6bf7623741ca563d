//! Request commands.

use bytes::Bytes;

/// A command verb plus its binary-safe arguments.
///
/// Built with [`Command::new`] and [`Command::arg`]; once handed to a
/// connection it is only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with the given verb (`"SET"`, `"GET"`, …).
    pub fn new(verb: impl AsRef<[u8]>) -> Self {
        Self {
            verb: Bytes::copy_from_slice(verb.as_ref()),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append several arguments in order.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|a| Bytes::copy_from_slice(a.as_ref())));
        self
    }

    /// Append an integer argument in its decimal form.
    pub fn arg_int(self, n: i64) -> Self {
        let mut buf = itoa::Buffer::new();
        let s = buf.format(n);
        self.arg(s)
    }

    pub fn verb(&self) -> &[u8] {
        &self.verb
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of wire elements (verb included).
    pub fn len(&self) -> usize {
        1 + self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Case-insensitive verb comparison.
    pub fn is(&self, verb: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb.as_bytes())
    }

    /// The first argument, which is the key for every single-key command.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.args.first().map(|b| b.as_ref())
    }
}

/// Build a [`Command`] from a verb and any number of arguments.
///
/// ```ignore
/// let set = cmd!("SET", "mykey", "myvalue");
/// ```
#[macro_export]
macro_rules! cmd {
    ($verb:expr $(, $arg:expr)* $(,)?) => {{
        $crate::resp::command::Command::new($verb)$(.arg($arg))*
    }};
}
