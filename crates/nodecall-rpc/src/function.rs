use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use nodecall_codec::{Decode, Encode, Reader, Writer};

use crate::error::RegistryError;

/// Numeric identifier of a registered function on the wire.
pub type FunctionId = u32;

/// Function ID carried by reply frames. Never assigned to a function.
pub const REPLY_ID: FunctionId = 0;

/// Set on an outgoing function ID to ask the callee for the return value.
pub const REPLY_FLAG: u32 = 0x8000_0000;

/// A native function callable with a decoded argument tuple.
///
/// Implemented for every `Fn` of up to twelve arguments whose arguments are
/// [`Decode`] and whose return type is [`Encode`]. `Args` is the argument
/// tuple, so `fn(i32, f32) -> i64` implements `RemoteFn<(i32, f32)>`.
pub trait RemoteFn<Args>: Send + Sync + 'static {
    type Output: Encode;

    fn invoke(&self, args: Args) -> Self::Output;

    /// Code address when `self` is a plain `fn` pointer.
    fn fn_address(&self) -> Option<usize>;
}

/// Identity of a bound function.
///
/// Fn items and non-capturing closures each have a type of their own, so the
/// type alone identifies them. Every `fn` pointer of one signature shares a
/// type, so pointers also carry their address. Capturing closures have
/// neither and cannot be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FnKey {
    type_id: TypeId,
    address: Option<usize>,
}

impl FnKey {
    pub(crate) fn of<F, Args>(f: &F) -> Result<Self, RegistryError>
    where
        F: RemoteFn<Args>,
    {
        let address = f.fn_address();
        if address.is_none() && std::mem::size_of::<F>() != 0 {
            return Err(RegistryError::Unaddressable);
        }
        Ok(Self {
            type_id: TypeId::of::<F>(),
            address,
        })
    }
}

macro_rules! impl_remote_fn {
    ($($ty:ident $arg:ident),*) => {
        impl<Func, Ret, $($ty,)*> RemoteFn<($($ty,)*)> for Func
        where
            Func: Fn($($ty),*) -> Ret + Send + Sync + 'static,
            Ret: Encode + 'static,
            $($ty: Decode + 'static,)*
        {
            type Output = Ret;

            #[allow(clippy::unused_unit)]
            fn invoke(&self, args: ($($ty,)*)) -> Ret {
                let ($($arg,)*) = args;
                self($($arg),*)
            }

            fn fn_address(&self) -> Option<usize> {
                (self as &dyn Any)
                    .downcast_ref::<fn($($ty),*) -> Ret>()
                    .map(|f| *f as usize)
            }
        }
    };
}

impl_remote_fn!();
impl_remote_fn!(A a);
impl_remote_fn!(A a, B b);
impl_remote_fn!(A a, B b, C c);
impl_remote_fn!(A a, B b, C c, D d);
impl_remote_fn!(A a, B b, C c, D d, E e);
impl_remote_fn!(A a, B b, C c, D d, E e, F f);
impl_remote_fn!(A a, B b, C c, D d, E e, F f, G g);
impl_remote_fn!(A a, B b, C c, D d, E e, F f, G g, H h);
impl_remote_fn!(A a, B b, C c, D d, E e, F f, G g, H h, I i);
impl_remote_fn!(A a, B b, C c, D d, E e, F f, G g, H h, I i, J j);
impl_remote_fn!(A a, B b, C c, D d, E e, F f, G g, H h, I i, J j, K k);
impl_remote_fn!(A a, B b, C c, D d, E e, F f, G g, H h, I i, J j, K k, L l);

type Invoker = Box<dyn Fn(&mut Reader<'_>) -> Result<(), RegistryError> + Send + Sync>;
type ReturningInvoker =
    Box<dyn Fn(&mut Reader<'_>, &mut Writer) -> Result<(), RegistryError> + Send + Sync>;

/// A registered function with its type-erased invokers.
pub struct FunctionEntry {
    id: FunctionId,
    name: String,
    key: FnKey,
    invoke: Invoker,
    invoke_with_return: ReturningInvoker,
}

impl FunctionEntry {
    pub(crate) fn new<F, Args>(id: FunctionId, name: String, key: FnKey, f: F) -> Self
    where
        F: RemoteFn<Args>,
        Args: Decode + 'static,
    {
        let f = Arc::new(f);
        let returning = Arc::clone(&f);
        Self {
            id,
            name,
            key,
            invoke: Box::new(move |reader: &mut Reader<'_>| {
                let args = reader.read::<Args>()?;
                let _ = f.invoke(args);
                Ok(())
            }),
            invoke_with_return: Box::new(move |reader: &mut Reader<'_>, writer: &mut Writer| {
                let args = reader.read::<Args>()?;
                writer.write(&returning.invoke(args));
                Ok(())
            }),
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn key(&self) -> FnKey {
        self.key
    }

    /// Decode the arguments from `reader` and call the function, discarding
    /// its return value.
    pub fn invoke(&self, reader: &mut Reader<'_>) -> Result<(), RegistryError> {
        (self.invoke)(reader)
    }

    /// Decode the arguments, call the function and encode its return value
    /// into `writer`.
    pub fn invoke_with_return(
        &self,
        reader: &mut Reader<'_>,
        writer: &mut Writer,
    ) -> Result<(), RegistryError> {
        (self.invoke_with_return)(reader, writer)
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
