//! The embedded Lua environment.
//!
//! The interpreter is single-threaded. Every call goes through a
//! [`LuaLocker`], a scoped acquisition released on all exit paths; holding
//! two lockers on the same engine from one thread deadlocks, so callers
//! never nest acquisitions.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use mlua::{Lua, LuaSerdeExt, MultiValue, Value};
use tracing::{debug, info};

use crate::errors::{VaultError, VaultResult};

/// Name of the startup hook, invoked once the scripts are loaded.
pub const INITIALIZE: &str = "Initialize";
/// Name of the shutdown hook.
pub const FINALIZE: &str = "Finalize";
/// Hook invoked after each committed instance ingestion.
pub const ON_STORED_INSTANCE: &str = "OnStoredInstance";
/// Predicate consulted for every incoming HTTP request.
pub const HTTP_FILTER: &str = "IncomingHttpRequestFilter";

/// An argument passed to a Lua predicate.
#[derive(Debug, Clone)]
pub enum LuaArg {
    Str(String),
    Bool(bool),
    Int(i64),
}

pub struct LuaEngine {
    lua: Mutex<Lua>,
}

/// Exclusive access to the interpreter.
pub struct LuaLocker<'a> {
    lua: MutexGuard<'a, Lua>,
}

impl LuaEngine {
    pub fn new() -> VaultResult<Self> {
        let lua = Lua::new();

        // route "print" into the server log
        let print = lua.create_function(|_, args: mlua::Variadic<Value>| {
            let mut parts = Vec::with_capacity(args.len());
            for value in args.iter() {
                parts.push(display_value(value));
            }
            info!("[lua] {}", parts.join("\t"));
            Ok(())
        })?;
        lua.globals().set("print", print)?;

        Ok(LuaEngine {
            lua: Mutex::new(lua),
        })
    }

    /// Acquire the interpreter. The lock is released when the returned
    /// locker goes out of scope, on every exit path.
    pub fn lock(&self) -> LuaLocker<'_> {
        LuaLocker {
            lua: self.lua.lock().unwrap_or_else(|poison| poison.into_inner()),
        }
    }

    /// Load every script listed in the configuration, then run `Initialize`.
    pub fn load_scripts(&self, paths: &[String]) -> VaultResult<()> {
        let locker = self.lock();
        for path in paths {
            locker.execute_file(Path::new(path))?;
        }
        if locker.has_function(INITIALIZE) {
            locker.call_void(INITIALIZE, &[])?;
        }
        Ok(())
    }

    /// Run the `Finalize` hook, if the scripts define one.
    pub fn finalize(&self) {
        let locker = self.lock();
        if locker.has_function(FINALIZE) {
            if let Err(e) = locker.call_void(FINALIZE, &[]) {
                tracing::warn!("Lua Finalize failed: {}", e);
            }
        }
    }
}

impl LuaLocker<'_> {
    pub fn execute(&self, chunk: &str) -> VaultResult<()> {
        self.lua.load(chunk).exec()?;
        Ok(())
    }

    pub fn execute_file(&self, path: &Path) -> VaultResult<()> {
        info!("Loading Lua script: {}", path.display());
        let content =
            std::fs::read_to_string(path).map_err(|_| VaultError::InexistentFile {
                path: path.display().to_string(),
            })?;
        self.lua
            .load(&content)
            .set_name(path.display().to_string())
            .exec()?;
        Ok(())
    }

    pub fn has_function(&self, name: &str) -> bool {
        matches!(
            self.lua.globals().get::<Value>(name),
            Ok(Value::Function(_))
        )
    }

    /// Call a global function for its boolean verdict.
    pub fn call_predicate(&self, name: &str, args: &[LuaArg]) -> VaultResult<bool> {
        let function: mlua::Function = self.lua.globals().get(name)?;
        let result: Value = function.call(self.make_args(args)?)?;
        match result {
            Value::Boolean(verdict) => Ok(verdict),
            other => {
                debug!(
                    "Lua predicate {} did not return a boolean ({:?})",
                    name, other
                );
                Ok(false)
            }
        }
    }

    /// Call a global function, discarding its result.
    pub fn call_void(&self, name: &str, args: &[LuaArg]) -> VaultResult<()> {
        let function: mlua::Function = self.lua.globals().get(name)?;
        function.call::<()>(self.make_args(args)?)?;
        Ok(())
    }

    /// Invoke the `OnStoredInstance` hook with the instance public id and
    /// its simplified tags as a table.
    pub fn call_on_stored(
        &self,
        public_id: &str,
        tags: &serde_json::Value,
    ) -> VaultResult<()> {
        let function: mlua::Function = self.lua.globals().get(ON_STORED_INSTANCE)?;
        let tags: Value = self.lua.to_value(tags)?;
        function.call::<()>((public_id, tags))?;
        Ok(())
    }

    fn make_args(&self, args: &[LuaArg]) -> VaultResult<MultiValue> {
        let mut values = MultiValue::new();
        for arg in args {
            let value = match arg {
                LuaArg::Str(s) => Value::String(self.lua.create_string(s)?),
                LuaArg::Bool(b) => Value::Boolean(*b),
                LuaArg::Int(i) => Value::Integer(*i),
            };
            values.push_back(value);
        }
        Ok(values)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => format!("<{}>", other.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executes_chunks_and_finds_functions() {
        let engine = LuaEngine::new().unwrap();
        let locker = engine.lock();
        locker
            .execute("function IncomingHttpRequestFilter(method, uri, ip, user) return uri ~= '/secret' end")
            .unwrap();

        assert!(locker.has_function(HTTP_FILTER));
        assert!(!locker.has_function("NoSuchFunction"));
    }

    #[test]
    fn predicate_receives_arguments() {
        let engine = LuaEngine::new().unwrap();
        let locker = engine.lock();
        locker
            .execute("function IncomingHttpRequestFilter(method, uri, ip, user) return uri ~= '/secret' end")
            .unwrap();

        let allowed = locker
            .call_predicate(
                HTTP_FILTER,
                &[
                    LuaArg::Str("GET".to_string()),
                    LuaArg::Str("/system".to_string()),
                    LuaArg::Str("127.0.0.1".to_string()),
                    LuaArg::Str("".to_string()),
                ],
            )
            .unwrap();
        assert!(allowed);

        let denied = locker
            .call_predicate(
                HTTP_FILTER,
                &[
                    LuaArg::Str("GET".to_string()),
                    LuaArg::Str("/secret".to_string()),
                    LuaArg::Str("127.0.0.1".to_string()),
                    LuaArg::Str("".to_string()),
                ],
            )
            .unwrap();
        assert!(!denied);
    }

    #[test]
    fn non_boolean_verdict_denies() {
        let engine = LuaEngine::new().unwrap();
        let locker = engine.lock();
        locker.execute("function Verdict() return 42 end").unwrap();
        assert!(!locker.call_predicate("Verdict", &[]).unwrap());
    }

    #[test]
    fn on_stored_receives_tags() {
        let engine = LuaEngine::new().unwrap();
        let locker = engine.lock();
        locker
            .execute(
                "seen = nil
                 function OnStoredInstance(id, tags) seen = id .. '/' .. tags.PatientID end",
            )
            .unwrap();

        let tags = serde_json::json!({"PatientID": "1234"});
        locker.call_on_stored("abcd", &tags).unwrap();

        locker
            .execute("assert(seen == 'abcd/1234', seen)")
            .unwrap();
    }

    #[test]
    fn lifecycle_hooks_are_optional() {
        let engine = LuaEngine::new().unwrap();
        engine.load_scripts(&[]).unwrap();
        engine.finalize();
    }
}
