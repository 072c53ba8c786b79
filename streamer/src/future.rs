// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Completion futures.
//!
//! Every submission returns a future that must complete exactly once. A
//! single-resolution future is a [`tokio::sync::oneshot`] channel; being
//! shared by at most two holders (the submitter and the completion path)
//! is expressed by wrapping the receiver in [`futures::future::Shared`] so
//! it can be cloned and `.await`-ed from more than one place without
//! consuming it.
//!
//! The aggregate future is represented as a refcounted joiner: a
//! background task awaits every registered child and resolves the outer
//! future once all children have completed, failing with the first error
//! encountered while still draining the rest (so that every child's
//! completion is observed exactly once, never silently dropped).

use crate::error::StreamerError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::oneshot;

/// A future that resolves exactly once with the outcome of a submission.
/// Cloneable: both the original caller and any code holding on to it for
/// aggregation purposes can `.await` it independently.
pub type CompletionFuture = Shared<BoxFuture<'static, Result<(), StreamerError>>>;

/// The write half of a [`CompletionFuture`]. Consumed on
/// [`Completer::complete`]; dropping it without completing resolves the
/// future with [`StreamerError::Interrupted`] (the channel closing is
/// treated as an abnormal, non-silent termination).
pub struct Completer {
    tx: Option<oneshot::Sender<Result<(), StreamerError>>>,
}

impl Completer {
    /// Resolves the paired future with `result`. A no-op if already
    /// completed (second and later calls are silently ignored, matching
    /// the "completes exactly once" invariant: the first writer wins).
    pub fn complete(mut self, result: Result<(), StreamerError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

/// Creates a fresh completer/future pair.
#[must_use]
pub fn new_completion() -> (Completer, CompletionFuture) {
    let (tx, rx) = oneshot::channel();
    let fut: BoxFuture<'static, Result<(), StreamerError>> = Box::pin(async move {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(StreamerError::Interrupted),
        }
    });
    (Completer { tx: Some(tx) }, fut.shared())
}

/// A growable joiner for completion futures. Child futures are registered
/// with [`AggregateFuture::add`] as batches are composed (e.g. once per
/// distinct stripe/node destination an `add()` call touched); calling
/// [`AggregateFuture::into_future`] hands back a single future that
/// resolves once every registered child has resolved.
#[derive(Default)]
pub struct AggregateFuture {
    children: Vec<CompletionFuture>,
}

impl AggregateFuture {
    /// Creates an empty joiner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a child future. Callers are expected to de-duplicate
    /// (e.g. `NodeBuffer::update` only adds a stripe's future the first
    /// time that stripe is touched during a given call, re-adding only if
    /// the stripe rotates to a new batch mid-call).
    pub fn add(&mut self, child: CompletionFuture) {
        self.children.push(child);
    }

    /// `true` if no children have been registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of registered children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Consumes the joiner, spawning a background task that awaits every
    /// child and resolving the returned future once all of them have
    /// completed (first error wins, but every child is still awaited).
    #[must_use]
    pub fn into_future(self) -> CompletionFuture {
        if self.children.is_empty() {
            let (completer, fut) = new_completion();
            completer.complete(Ok(()));
            return fut;
        }
        let (completer, fut) = new_completion();
        let children = self.children;
        let _ = tokio::spawn(async move {
            let mut first_err = None;
            for child in children {
                if let Err(e) = child.await {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            completer.complete(match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            });
        });
        fut
    }
}

/// Boxes a plain future into a [`CompletionFuture`]-compatible shared
/// future, useful for tests that want to assert on a pre-resolved result.
pub fn ready(result: Result<(), StreamerError>) -> CompletionFuture {
    let fut: Pin<Box<dyn Future<Output = Result<(), StreamerError>> + Send>> =
        Box::pin(async move { result });
    fut.shared()
}
