//! Middleware and the cooperative chain.
//!
//! A [`Middleware`] is invoked with the request context and a [`Next`]
//! continuation. It may mutate the context, invoke the continuation zero
//! or one time, and produce a response. [`Chain`] composes an ordered list
//! of middlewares into one: the composed value is itself a [`Middleware`],
//! so chains nest.
//!
//! Each invocation of a composed chain tracks the deepest frame entered
//! with a monotonic index. Invoking `next` a second time from the same
//! frame cannot advance the index and aborts with [`Error::ChainMisuse`];
//! a later middleware is never entered twice. Concurrent invocations are
//! independent; the index lives on the invocation, not the chain.

use crate::prelude::*;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The boxed future every middleware returns.
pub type RetFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A composable request handler.
///
/// Implemented by the built-in handlers, by [`Chain`], by the routers, and
/// by any `fn` with the matching signature:
///
/// ```
/// use verge::prelude::*;
///
/// fn teapot<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
///     Box::pin(async move {
///         if ctx.path() == "/coffee" {
///             ctx.set_status(StatusCode::IM_A_TEAPOT)?;
///             Ok(())
///         } else {
///             next.invoke(ctx).await
///         }
///     })
/// }
/// # let _ = teapot;
/// ```
pub trait Middleware: Send + Sync {
    /// Processes `ctx`, delegating downstream through `next` at most once.
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>>;
}

impl<F> Middleware for F
where
    F: for<'a> Fn(&'a mut Ctx, Next<'a>) -> RetFut<'a, Result<(), Error>> + Send + Sync,
{
    #[inline]
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        self(ctx, next)
    }
}

/// The continuation under the innermost frame of a chain invocation.
///
/// The routers pass their own `next` here; the connection loop passes the
/// default-404 tail.
pub trait Tail: Send + Sync {
    /// Runs whatever follows the chain.
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> RetFut<'a, Result<(), Error>>;
}

/// One invocation of a composed chain.
struct ChainRun<'a> {
    stack: &'a [Arc<dyn Middleware>],
    /// The deepest frame entered; see the module documentation.
    deepest: AtomicUsize,
    tail: &'a dyn Tail,
}

/// The continuation handed to a middleware.
///
/// Invoking it more than once from the same frame is a programming error
/// the chain detects; see [`Error::ChainMisuse`].
#[derive(Clone, Copy)]
pub struct Next<'a> {
    frame: usize,
    run: &'a ChainRun<'a>,
}
impl<'a> Next<'a> {
    /// Delegates to the next middleware in the chain, or to the tail when
    /// the chain is exhausted.
    ///
    /// # Errors
    ///
    /// [`Error::ChainMisuse`] on a repeated invocation from this frame;
    /// otherwise whatever downstream produces.
    pub fn invoke<'b>(&self, ctx: &'b mut Ctx) -> RetFut<'b, Result<(), Error>>
    where
        'a: 'b,
    {
        let frame = self.frame;
        let run = self.run;
        Box::pin(async move {
            if run
                .deepest
                .compare_exchange(frame, frame + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(Error::ChainMisuse);
            }
            match run.stack.get(frame) {
                Some(mw) => mw.handle(ctx, Next { frame: frame + 1, run }).await,
                None => run.tail.call(ctx).await,
            }
        })
    }
}
impl Tail for Next<'_> {
    #[inline]
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> RetFut<'a, Result<(), Error>> {
        self.invoke(ctx)
    }
}
impl Debug for Next<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Next {{ frame: {} }}", self.frame)
    }
}

/// An ordered list of middlewares composed into one.
///
/// Composition is idempotent: the chain holds the list and builds fresh
/// invocation state per call, so composing the same list twice behaves
/// identically.
#[derive(Clone, Default)]
pub struct Chain {
    stack: Vec<Arc<dyn Middleware>>,
}
impl Chain {
    /// Composes `stack`, in order.
    #[must_use]
    pub fn new(stack: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stack }
    }
    /// Appends a middleware to the end of the chain.
    pub fn push(&mut self, mw: Arc<dyn Middleware>) {
        self.stack.push(mw);
    }
    /// The number of middlewares in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }
    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Runs the chain over `ctx`, with `tail` as the outermost
    /// continuation.
    ///
    /// # Errors
    ///
    /// Whatever the middlewares or `tail` produce.
    pub async fn execute(&self, ctx: &mut Ctx, tail: &dyn Tail) -> Result<(), Error> {
        let run = ChainRun {
            stack: &self.stack,
            deepest: AtomicUsize::new(0),
            tail,
        };
        Next { frame: 0, run: &run }.invoke(ctx).await
    }
}
impl Middleware for Chain {
    fn handle<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move { self.execute(ctx, &next).await })
    }
}
impl Debug for Chain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Chain {{ {} middlewares }}", self.stack.len())
    }
}
impl From<Vec<Arc<dyn Middleware>>> for Chain {
    fn from(stack: Vec<Arc<dyn Middleware>>) -> Self {
        Self::new(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::test::ctx;

    struct LogTail;
    impl Tail for LogTail {
        fn call<'a>(&'a self, ctx: &'a mut Ctx) -> RetFut<'a, Result<(), Error>> {
            Box::pin(async move {
                ctx.log("tail", "reached");
                Ok(())
            })
        }
    }

    fn outer<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.log("outer", "in");
            let result = next.invoke(ctx).await;
            ctx.log("outer", "out");
            result
        })
    }
    fn inner<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            ctx.log("inner", "in");
            next.invoke(ctx).await
        })
    }
    fn greedy<'a>(ctx: &'a mut Ctx, next: Next<'a>) -> RetFut<'a, Result<(), Error>> {
        Box::pin(async move {
            next.invoke(ctx).await?;
            next.invoke(ctx).await
        })
    }

    #[tokio::test]
    async fn declaration_order() {
        let (mut ctx, _io) = ctx(Method::GET, "/");
        let chain = Chain::new(vec![Arc::new(outer), Arc::new(inner)]);
        chain.execute(&mut ctx, &LogTail).await.unwrap();
        assert_eq!(
            ctx.loggers(),
            ["outer: in", "inner: in", "tail: reached", "outer: out"]
        );
    }

    #[tokio::test]
    async fn empty_chain_reaches_tail() {
        let (mut ctx, _io) = ctx(Method::GET, "/");
        Chain::default().execute(&mut ctx, &LogTail).await.unwrap();
        assert_eq!(ctx.loggers(), ["tail: reached"]);
    }

    #[tokio::test]
    async fn second_next_aborts() {
        let (mut ctx, _io) = ctx(Method::GET, "/");
        let chain = Chain::new(vec![Arc::new(greedy), Arc::new(inner)]);
        let result = chain.execute(&mut ctx, &LogTail).await;
        assert!(matches!(result, Err(Error::ChainMisuse)));
        // The downstream middleware ran exactly once.
        assert_eq!(ctx.loggers(), ["inner: in", "tail: reached"]);
    }

    #[tokio::test]
    async fn nested_chains_keep_order() {
        let (mut ctx, _io) = ctx(Method::GET, "/");
        let nested: Arc<dyn Middleware> = Arc::new(Chain::new(vec![Arc::new(inner)]));
        let chain = Chain::new(vec![Arc::new(outer), nested]);
        chain.execute(&mut ctx, &LogTail).await.unwrap();
        assert_eq!(
            ctx.loggers(),
            ["outer: in", "inner: in", "tail: reached", "outer: out"]
        );
    }
}
