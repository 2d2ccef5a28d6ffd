//! How a peer turns an incoming request into a method call.
//!
//! Two strategies share the [`Dispatch`] trait. A [`MethodTable`] is built
//! once when a [`PeerService`] registers and maps method names to typed
//! closures. A hand-written `Dispatch` skips the table entirely and matches
//! on the method name itself. Callers cannot tell the two apart.

use std::{any::Any, sync::Arc};

use hashbrown::HashMap;
use serde::{de::DeserializeOwned, Serialize};

use super::{codec::Payload, BoxError, Codec, Message, PeerHandle, RpcError};

/// Ambient value produced by the exchange's pre-processing hook and handed
/// to arguments that want it.
pub type Context = Arc<dyn Any + Send + Sync>;

/// What a method may return: a reply to encode, or nothing for events.
pub type Outcome = Result<Option<Box<dyn Message>>, RpcError>;

/// An argument type. The hooks let a type receive the id of the calling
/// node or the request context, both left untouched by default.
pub trait Bean: DeserializeOwned + Send + 'static {
    fn bind_caller(&mut self, _node_id: &str) {}

    fn bind_context(&mut self, _ctx: &Context) {}
}

macro_rules! plain_beans {
    ($($t:ty),*) => {
        $(impl Bean for $t {})*
    };
}

plain_beans!(
    (), bool, u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, String,
    Vec<u8>, Vec<String>
);

/// One incoming request as seen by a [`Dispatch`].
pub struct Invocation {
    caller: String,
    peer: String,
    func: String,
    context: Option<Context>,
    codec: Codec,
    payload: Payload,
}

impl Invocation {
    pub(crate) fn new(
        caller: &str,
        peer: &str,
        func: &str,
        context: Option<Context>,
        codec: Codec,
        payload: Payload,
    ) -> Self {
        Self {
            caller: caller.to_string(),
            peer: peer.to_string(),
            func: func.to_string(),
            context,
            codec,
            payload,
        }
    }

    /// Node id of the caller.
    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    /// `Peer.Func`, for error messages.
    pub fn method(&self) -> String {
        format!("{}.{}", self.peer, self.func)
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Takes the arguments, either the caller's own value when it lives in
    /// this node or decoded from the payload, and binds caller and context.
    /// Can be taken once.
    pub fn args<A: Bean>(&mut self) -> Result<A, RpcError> {
        let payload = std::mem::replace(&mut self.payload, Payload::Empty);
        let mut args: A = payload.take(self.codec)?;
        args.bind_caller(&self.caller);
        if let Some(ctx) = &self.context {
            args.bind_context(ctx);
        }
        Ok(args)
    }
}

/// Serves requests for one peer.
pub trait Dispatch: Send + Sync + 'static {
    /// Runs the method named by `inv.func()`. Returns the reply for calls
    /// and `None` for events. Unknown methods fail with
    /// [`RpcError::NoSuchMethod`].
    fn dispatch(&self, inv: &mut Invocation) -> Outcome;
}

type Method<S> = Box<dyn Fn(&S, &mut Invocation) -> Outcome + Send + Sync>;

/// Name-to-method table of a [`PeerService`], resolved at registration.
pub struct MethodTable<S> {
    methods: HashMap<String, Method<S>>,
}

impl<S: 'static> MethodTable<S> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Adds a method with a reply. The reply starts out as `R::default()`,
    /// so collections are empty rather than missing.
    pub fn call<A, R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: Bean,
        R: Serialize + Default + Send + 'static,
        F: Fn(&S, A, &mut R) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Box::new(move |service, inv| {
                let args = inv.args::<A>()?;
                let mut reply = R::default();
                f(service, args, &mut reply)
                    .map_err(|e| RpcError::Handler(e.to_string()))?;
                Ok(Some(Box::new(reply)))
            }),
        );
        self
    }

    /// Adds a method without a reply.
    pub fn event<A, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: Bean,
        F: Fn(&S, A) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Box::new(move |service, inv| {
                let args = inv.args::<A>()?;
                f(service, args).map_err(|e| RpcError::Handler(e.to_string()))?;
                Ok(None)
            }),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<S: 'static> Default for MethodTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// A service object whose methods are listed in a [`MethodTable`].
pub trait PeerService: Send + Sync + Sized + 'static {
    fn methods(table: &mut MethodTable<Self>);

    /// Receives the handle of the peer the service was registered as.
    fn attach(&self, _handle: PeerHandle) {}
}

/// Table-driven dispatch over a registered [`PeerService`].
pub(crate) struct TableDispatch<S> {
    service: Arc<S>,
    table: MethodTable<S>,
}

impl<S: PeerService> TableDispatch<S> {
    pub(crate) fn new(service: Arc<S>) -> Self {
        let mut table = MethodTable::new();
        S::methods(&mut table);
        Self { service, table }
    }
}

impl<S: PeerService> Dispatch for TableDispatch<S> {
    fn dispatch(&self, inv: &mut Invocation) -> Outcome {
        match self.table.methods.get(inv.func()) {
            Some(method) => method(&self.service, inv),
            None => Err(RpcError::NoSuchMethod(inv.method())),
        }
    }
}
