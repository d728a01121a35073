use serde::{Serialize, Deserialize};
use std::fmt;

/// Dense index of a registered function, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FuncId(pub u32);

impl FuncId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
    pub fn new(idx: usize) -> Self { Self(idx as u32) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arity {
    /// Zero-argument function, evaluated once per pass.
    Constant,
    /// One integer argument, evaluated once per timestep.
    Timestep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub name: String,
    pub arity: Arity,
}

/// Identity of a cache entry: which function, at which argument.
///
/// `arg` is `None` for constants and `Some(t)` for timestep functions. Negative
/// steps are legal keys; whether a body ever asks for one is the model's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey {
    pub func: FuncId,
    pub arg: Option<i64>,
}

impl CallKey {
    pub fn constant(func: FuncId) -> Self { Self { func, arg: None } }
    pub fn step(func: FuncId, t: i64) -> Self { Self { func, arg: Some(t) } }
}

/// Renders `name(t)` / `name()` labels without needing the registry at hand.
pub struct CallLabel<'a> {
    pub name: &'a str,
    pub arg: Option<i64>,
}

impl fmt::Display for CallLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.arg {
            Some(t) => write!(f, "{}({})", self.name, t),
            None => write!(f, "{}()", self.name),
        }
    }
}
