// Frame stack driver
//
// Every task owns one stack of frames. The driver repeatedly resumes the top
// frame and routes whatever it yields: to the first matching middleware, or to
// the built-in handling of the core operation kinds. A completed frame runs its
// deferred operations on this same stack before being popped, and its result
// flows into the frame below it. Deferred operations run shielded: cancelling
// the task never interrupts them.
//
// Results live on the frames. Dispatching an operation either pushes a new
// frame, whose completion will later write the caller's result, or writes the
// result of the current frame directly. Dispatch errors are written the same
// way and thrown into the frame on its next resumption.

use std::borrow::Cow;
use std::mem;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::context::Context;
use crate::diagnostics::Diagnostic;
use crate::engine::Environment;
use crate::error::{Error, Result};
use crate::generator::{BoxGenerator, GeneratorState, Resume, Yielded};
use crate::middleware::Handlers;
use crate::operation::{kind, Operation};
use crate::task::{Task, TaskShared};
use crate::value::Value;

/// Where a handler frame sits in the middleware chain of its kind.
#[derive(Clone)]
struct HandlerSlot {
    kind: String,
    handlers: Handlers,
    index: usize,
}

struct Frame {
    generator: BoxGenerator,
    /// Outcome delivered on the next resumption, or once done, the frame's own.
    result: Result<Value>,
    /// Popped from the back, so they run last-registered first.
    defers: Vec<Operation>,
    done: bool,
    /// Set once the frame has been forced to return by a cancellation.
    returning: bool,
    handler: Option<HandlerSlot>,
}

impl Frame {
    fn new(generator: BoxGenerator) -> Self {
        Self {
            generator,
            result: Ok(Value::Null),
            defers: Vec::new(),
            done: false,
            returning: false,
            handler: None,
        }
    }

    fn handler(generator: BoxGenerator, slot: HandlerSlot) -> Self {
        Self {
            handler: Some(slot),
            ..Self::new(generator)
        }
    }

    fn name(&self) -> Cow<'_, str> {
        match &self.handler {
            Some(slot) => Cow::Owned(format!("<yield {}>", slot.kind)),
            None => Cow::Borrowed(self.generator.name()),
        }
    }
}

pub(crate) struct Stack {
    env: Arc<Environment>,
    ctx: Context,
    shared: Arc<TaskShared>,
    frames: Vec<Frame>,
    /// Result of the task once the bottom frame has been popped.
    root: Result<Value>,
    /// Set while dispatching a deferred operation; its frame is shielded from
    /// cancellation.
    shield: bool,
}

impl Stack {
    pub(crate) fn new(env: Arc<Environment>, ctx: Context, shared: Arc<TaskShared>) -> Self {
        Self {
            env,
            ctx,
            shared,
            frames: Vec::new(),
            root: Ok(Value::Null),
            shield: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    /// Dispatch `root` and drive the stack until it is empty.
    pub(crate) async fn run(mut self, root: Yielded) -> Result<Value> {
        if !self.shared.begin() {
            self.shared.settle();
            debug!("cancelled before start");
            return Err(Error::Cancelled);
        }

        self.handle(root).await;
        while let Some(depth) = self.frames.len().checked_sub(1) {
            self.step(depth).await;
        }

        if self.shared.settle() {
            debug!("settled after cancellation");
            return Err(Error::Cancelled);
        }
        debug!(ok = self.root.is_ok(), "settled");
        self.root
    }

    fn push(&mut self, frame: Frame) {
        trace!(frame = %frame.name(), depth = self.frames.len(), "push");
        self.shared.push_mark(mem::take(&mut self.shield));
        self.frames.push(frame);
    }

    fn pop(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.shared.pop_mark();
        Some(frame)
    }

    fn current_result(&mut self) -> &mut Result<Value> {
        match self.frames.last_mut() {
            Some(frame) => &mut frame.result,
            None => &mut self.root,
        }
    }

    /// Resume the frame at `depth`, which is the top of the stack.
    async fn step(&mut self, depth: usize) {
        let forced = self.shared.begin_forced_return(depth);
        let frame = &mut self.frames[depth];
        let delivered = mem::replace(&mut frame.result, Ok(Value::Null));
        let input = if forced {
            trace!(frame = %frame.name(), "forcing return");
            frame.returning = true;
            Resume::Return
        } else {
            match delivered {
                Ok(value) => Resume::Next(value),
                Err(error) => Resume::Throw(error),
            }
        };

        match frame.generator.resume(input).await {
            GeneratorState::Complete(result) => {
                frame.result = match result {
                    Err(Error::Interrupted) if frame.returning => Ok(Value::Null),
                    result => result,
                };
                frame.done = true;
                trace!(frame = %frame.name(), ok = frame.result.is_ok(), "complete");
                self.shift().await;
            }
            GeneratorState::Yielded(yielded) => {
                // The frame will be forced to return on its next resumption.
                if self.shared.is_cancel_pending(depth) {
                    trace!(?yielded, "dropping operation of cancelled frame");
                    return;
                }
                self.handle(yielded).await;
            }
        }
    }

    async fn handle(&mut self, yielded: Yielded) {
        if let Err(error) = self.dispatch(yielded).await {
            debug!(%error, "dispatch failed");
            *self.current_result() = Err(error);
        }
    }

    async fn dispatch(&mut self, yielded: Yielded) -> Result<()> {
        // `next` continues the chain of the handler frame that yielded it.
        let origin = self.frames.last().and_then(|frame| frame.handler.clone());
        let mut yielded = yielded;

        loop {
            let operation = match yielded {
                Yielded::Operation(operation) => operation,
                Yielded::Generator(generator) if !self.env.registry.contains(kind::EXECUTE) => {
                    self.push(Frame::new(generator));
                    return Ok(());
                }
                Yielded::Generator(generator) => Operation::Execute(generator),
            };

            let (operation, handlers, from) = match operation {
                Operation::Next(inner) => {
                    let slot = origin.as_ref().ok_or(Error::NextOutsideHandler)?;
                    if inner.kind() != slot.kind {
                        return Err(Error::NextKindMismatch {
                            expected: slot.kind.clone(),
                            got: inner.kind().to_owned(),
                        });
                    }
                    (*inner, Some(Arc::clone(&slot.handlers)), slot.index + 1)
                }
                operation => {
                    let handlers = self.env.registry.handlers(operation.kind()).cloned();
                    (operation, handlers, 0)
                }
            };

            if let Some(handlers) = handlers {
                let matched = (from..handlers.len())
                    .find(|&index| handlers[index].filter(&operation, &self.ctx));
                if let Some(index) = matched {
                    let kind = operation.kind().to_owned();
                    debug!(%kind, index, "middleware");
                    let generator = handlers[index].handle(operation, &self.ctx)?;
                    self.push(Frame::handler(
                        generator,
                        HandlerSlot {
                            kind,
                            handlers,
                            index,
                        },
                    ));
                    return Ok(());
                }
            }

            match self.core(operation).await? {
                Some(operation) => yielded = Yielded::Operation(operation),
                None => return Ok(()),
            }
        }
    }

    /// Built-in handling of an operation no middleware took. Returns an
    /// operation to dispatch next, for kinds that wrap one.
    async fn core(&mut self, operation: Operation) -> Result<Option<Operation>> {
        match operation {
            Operation::Call(call) => {
                let generator = call.func.call(call.args)?;
                self.push(Frame::new(generator));
            }
            Operation::Execute(generator) => self.push(Frame::new(generator)),
            Operation::Fork(inner) => {
                let task = Task::new(
                    Arc::clone(&self.env),
                    self.ctx.clone(),
                    Yielded::Operation(*inner),
                );
                let handle = task.spawn();
                debug!(child = %handle.id(), "fork");
                *self.current_result() = Ok(Value::Task(handle));
            }
            Operation::Start(inner) => return Ok(Some(*inner)),
            Operation::Defer(inner) => {
                let frame = self.frames.last_mut().ok_or_else(|| {
                    Error::usage(kind::DEFER, "no frame to attach the operation to")
                })?;
                frame.defers.push(*inner);
            }
            Operation::Recover => self.recover(),
            Operation::Terminal(inner) => {
                if matches!(*inner, Operation::Fork(_) | Operation::Defer(_)) {
                    return Err(Error::ForbiddenTerminal(inner.kind().to_owned()));
                }
                match self.frames.last() {
                    None => return Err(Error::usage(kind::TERMINAL, "no frame to replace")),
                    Some(frame) if frame.done => {
                        return Err(Error::usage(kind::TERMINAL, "the frame has already completed"))
                    }
                    Some(_) => {}
                }
                if let Some(frame) = self.pop() {
                    self.terminate(frame).await;
                }
                return Ok(Some(*inner));
            }
            Operation::Next(_) => return Err(Error::NextOutsideHandler),
            Operation::Custom(custom) => {
                return Err(Error::UnrecognizedOperation(custom.kind.into_owned()))
            }
        }
        Ok(None)
    }

    /// Move the error of a completed frame below into the current frame.
    fn recover(&mut self) {
        let depth = self.frames.len();
        if depth < 2 {
            return;
        }
        let (below, current) = self.frames.split_at_mut(depth - 1);
        let completed = &mut below[depth - 2];
        if !completed.done || completed.result.is_ok() {
            return;
        }
        if let Err(error) = mem::replace(&mut completed.result, Ok(Value::Null)) {
            debug!(%error, "recovered");
            current[0].result = Ok(Value::Error(error));
        }
    }

    /// Finish a frame replaced by a tail operation. Misuse is reported, never
    /// raised.
    async fn terminate(&mut self, mut frame: Frame) {
        let task = self.shared.id();
        let name = frame.name().into_owned();
        if !frame.defers.is_empty() {
            self.env.diagnostics.emit(Diagnostic::SkippedDefers {
                task,
                frame: name.clone(),
                count: frame.defers.len(),
            });
        }
        match frame.generator.resume(Resume::Return).await {
            GeneratorState::Complete(Ok(_)) | GeneratorState::Complete(Err(Error::Interrupted)) => {
                trace!(frame = %name, "terminated");
            }
            GeneratorState::Complete(Err(error)) => {
                self.env.diagnostics.emit(Diagnostic::FailedTermination {
                    task,
                    frame: name,
                    error: error.to_string(),
                });
            }
            GeneratorState::Yielded(_) => {
                self.env
                    .diagnostics
                    .emit(Diagnostic::UnfinishedTermination { task, frame: name });
            }
        }
    }

    /// Unwind completed frames: run their deferred operations, then pop them
    /// and hand their results down. Stops at the first frame still running or
    /// when a deferred operation pushed a frame of its own.
    async fn shift(&mut self) {
        while let Some(depth) = self.frames.len().checked_sub(1) {
            if let Some(operation) = self.frames[depth].defers.pop() {
                let prior = mem::replace(&mut self.frames[depth].result, Ok(Value::Null));
                self.shield = true;
                let outcome = self.dispatch(Yielded::Operation(operation)).await;
                self.shield = false;
                self.frames[depth].result = match outcome {
                    Ok(()) => prior,
                    Err(error) => Err(Error::deferred(error, prior)),
                };
                if self.frames.len() > depth + 1 {
                    return;
                }
                continue;
            }

            let Some(finished) = self.pop() else { return };
            trace!(frame = %finished.name(), ok = finished.result.is_ok(), "pop");
            match self.frames.last_mut() {
                Some(caller) if !caller.done => caller.result = finished.result,
                // A deferred frame failed; its error overrides the outcome of
                // the frame that registered it.
                Some(caller) => {
                    if let Err(error) = finished.result {
                        let prior = mem::replace(&mut caller.result, Ok(Value::Null));
                        caller.result = Err(Error::deferred(error, prior));
                    }
                }
                None => self.root = finished.result,
            }

            if !self.frames.last().is_some_and(|frame| frame.done) {
                return;
            }
        }
    }
}
