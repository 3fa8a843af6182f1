use std::{
    any::Any,
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
};

use serde_json::Value;

use super::{
    param::{ConversionError, FromParam, ParamType},
    reply::{IntoReply, Reply, ReturnKind},
};
use crate::{error::RpcError, AnyResult};

/// A callable that takes positional JSON parameters.
///
/// Implemented for every `Fn` of up to six [`FromParam`] arguments returning
/// something [`IntoReply`]. The `Args` parameter only exists to keep those
/// implementations apart.
///
/// [`Handler::invoke`] separates the two ways a call can fail: the outer
/// `Err` means the parameters did not convert and the function never ran, the
/// inner one is the function's own failure.
pub trait Handler<Args>: Send + Sync + 'static {
    fn param_types() -> Vec<ParamType>;

    fn return_kind() -> ReturnKind;

    /// Whether every parameter converts, without running the function.
    fn accepts(params: &[Value]) -> bool;

    fn invoke(&self, params: &[Value]) -> Result<AnyResult<Reply>, ConversionError>;
}

macro_rules! impl_handler {
    ($arity: expr; $($ty: ident),*) => {
        #[allow(non_snake_case, unused_variables, unused_mut)]
        impl<F, R, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: IntoReply,
            $($ty: FromParam,)*
        {
            fn param_types() -> Vec<ParamType> {
                vec![$(<$ty as FromParam>::param_type()),*]
            }

            fn return_kind() -> ReturnKind {
                R::KIND
            }

            fn accepts(params: &[Value]) -> bool {
                if params.len() != $arity {
                    return false;
                }
                let mut values = params.iter();
                true $(&& values.next().is_some_and(|v| <$ty as FromParam>::from_param(v).is_ok()))*
            }

            fn invoke(&self, params: &[Value]) -> Result<AnyResult<Reply>, ConversionError> {
                if params.len() != $arity {
                    return Err(ConversionError::arity($arity, params.len()));
                }
                let mut values = params.iter().enumerate();
                $(
                    let (index, value) = values
                        .next()
                        .ok_or_else(|| ConversionError::arity($arity, params.len()))?;
                    let $ty = <$ty as FromParam>::from_param(value).map_err(|e| e.at(index))?;
                )*
                Ok(match catch_unwind(AssertUnwindSafe(|| (self)($($ty),*))) {
                    Ok(ret) => ret.into_reply(),
                    Err(panic) => Err(RpcError::Invocation(format!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))
                    .into()),
                })
            }
        }
    };
}

impl_handler!(0;);
impl_handler!(1; A1);
impl_handler!(2; A1, A2);
impl_handler!(3; A1, A2, A3);
impl_handler!(4; A1, A2, A3, A4);
impl_handler!(5; A1, A2, A3, A4, A5);
impl_handler!(6; A1, A2, A3, A4, A5, A6);

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// [`Handler`] with its argument tuple erased, so differently shaped
/// handlers can share one method table.
pub(crate) trait Invoke: Send + Sync {
    fn accepts(&self, params: &[Value]) -> bool;

    fn invoke(&self, params: &[Value]) -> Result<AnyResult<Reply>, ConversionError>;
}

pub(crate) struct Erased<H, Args> {
    handler: H,
    _args: PhantomData<fn(Args)>,
}

impl<H, Args> Erased<H, Args> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _args: PhantomData,
        }
    }
}

impl<H, Args> Invoke for Erased<H, Args>
where
    H: Handler<Args>,
    Args: 'static,
{
    #[inline]
    fn accepts(&self, params: &[Value]) -> bool {
        H::accepts(params)
    }

    #[inline]
    fn invoke(&self, params: &[Value]) -> Result<AnyResult<Reply>, ConversionError> {
        self.handler.invoke(params)
    }
}
