use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::de::from_value;
use crate::error::{CallError, SerializationError};
use crate::ser::to_value;
use crate::session::{Completion, Session};
use crate::transport::Transport;
use crate::value::Value;

/// An ordered list of call arguments.
///
/// Implemented for `()` and tuples of up to eight serializable values, and
/// for `Vec<Value>` when the arity is only known at runtime.
pub trait Arguments {
    fn to_values(&self) -> Result<Vec<Value>, SerializationError>;
}

impl Arguments for () {
    fn to_values(&self) -> Result<Vec<Value>, SerializationError> {
        Ok(Vec::new())
    }
}

impl Arguments for Vec<Value> {
    fn to_values(&self) -> Result<Vec<Value>, SerializationError> {
        Ok(self.clone())
    }
}

macro_rules! impl_arguments {
    ($($arg:ident),+) => {
        impl<$($arg: Serialize),+> Arguments for ($($arg,)+) {
            #[allow(non_snake_case)]
            fn to_values(&self) -> Result<Vec<Value>, SerializationError> {
                let ($($arg,)+) = self;
                Ok(vec![$(to_value($arg)?),+])
            }
        }
    };
}

impl_arguments!(A1);
impl_arguments!(A1, A2);
impl_arguments!(A1, A2, A3);
impl_arguments!(A1, A2, A3, A4);
impl_arguments!(A1, A2, A3, A4, A5);
impl_arguments!(A1, A2, A3, A4, A5, A6);
impl_arguments!(A1, A2, A3, A4, A5, A6, A7);
impl_arguments!(A1, A2, A3, A4, A5, A6, A7, A8);

/// A remote method bound to its argument types `A` and result type `R`.
///
/// ```ignore
/// let mut add = RemoteProcedure::<i32, (i32, i32)>::new("add");
/// assert_eq!(*add.call(&mut session, (2, 3)).await?, 5);
/// ```
pub struct RemoteProcedure<R, A = ()> {
    name: String,
    result: Option<R>,
    _args: PhantomData<fn(A)>,
}

impl<R, A> RemoteProcedure<R, A>
where
    R: DeserializeOwned + Send + 'static,
    A: Arguments,
{
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            result: None,
            _args: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last successfully decoded result.
    pub fn result(&self) -> Option<&R> {
        self.result.as_ref()
    }

    /// Invokes the method and waits for its result.
    pub async fn call<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        args: A,
    ) -> Result<&R, CallError> {
        let params = args.to_values()?;
        let value = session.call(&self.name, &params).await?;
        let result = from_value(value)?;
        Ok(self.result.insert(result))
    }

    /// Submits the call and returns at once. The returned [`PendingCall`]
    /// resolves after [`Session::drive`] has processed the response.
    pub fn begin<T: Transport>(
        &mut self,
        session: &mut Session<T>,
        args: A,
    ) -> Result<PendingCall<'_, R>, CallError> {
        let params = args.to_values()?;
        let (sender, receiver) = oneshot::channel();
        session.begin(&self.name, &params, Box::new(ResultSlot { sender }))?;
        debug!(method = %self.name, "call begun");

        Ok(PendingCall {
            slot: &mut self.result,
            receiver,
        })
    }
}

struct ResultSlot<R> {
    sender: oneshot::Sender<Result<R, CallError>>,
}

impl<R> Completion for ResultSlot<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn complete(self: Box<Self>, outcome: Result<Value, CallError>) {
        let typed = outcome.and_then(|value| from_value(value).map_err(CallError::from));
        self.sender.send(typed).ok();
    }
}

/// A call submitted with [`RemoteProcedure::begin`].
///
/// Holds the procedure's result slot, so the procedure cannot be reused or
/// dropped until the call has been waited for.
pub struct PendingCall<'h, R> {
    slot: &'h mut Option<R>,
    receiver: oneshot::Receiver<Result<R, CallError>>,
}

impl<'h, R> PendingCall<'h, R> {
    /// Waits for the outcome, storing a successful result in the procedure.
    pub async fn wait(self) -> Result<&'h R, CallError> {
        let PendingCall { slot, receiver } = self;
        let result = receiver.await.map_err(|_| CallError::Canceled)??;
        Ok(slot.insert(result))
    }

    /// Returns the outcome if it has been delivered, or the pending call
    /// back if not.
    pub fn try_wait(self) -> Result<Result<&'h R, CallError>, Self> {
        let PendingCall { slot, mut receiver } = self;
        match receiver.try_recv() {
            Ok(Ok(result)) => Ok(Ok(slot.insert(result))),
            Ok(Err(e)) => Ok(Err(e)),
            Err(oneshot::error::TryRecvError::Closed) => Ok(Err(CallError::Canceled)),
            Err(oneshot::error::TryRecvError::Empty) => Err(PendingCall { slot, receiver }),
        }
    }
}
