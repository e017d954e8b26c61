//! Parameter descriptors.
//!
//! A handler's parameters are declared once, at registration, as a tuple of
//! descriptors. Each descriptor knows where its value comes from and how to
//! convert it; the tuple binds to a tuple of values at request time with no
//! further type inspection.

use std::borrow::Cow;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::value::{ConversionError, ParamValue};
use crate::router::Controller;
use crate::session::HttpSession;
use crate::StatusCode;

/// Binding failed for one request.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("missing required parameter `{name}`")]
    Missing { name: String },

    #[error("parameter `{name}`: {source}")]
    Conversion {
        name: String,
        #[source]
        source: ConversionError,
    },

    #[error("invalid request body: {0}")]
    InvalidBody(#[source] serde_json::Error),
}

impl BindError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) => StatusCode::BadRequest,
            Self::Missing { .. } | Self::Conversion { .. } => StatusCode::InternalServerError,
        }
    }
}

/// Where a declared parameter is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Session,
    /// Route value first, then query string.
    Named,
    Body,
    Controller,
}

/// Registration-time description of one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub name: String,
    pub source: ParamSource,
    /// No default and not optional.
    pub required: bool,
}

/// A parameter (or tuple of parameters) that can be bound from a session.
pub trait Bind: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Resolves the value for this request.
    ///
    /// # Errors
    ///
    /// [`BindError`] when a required value is missing or cannot be converted.
    fn bind(&self, session: &HttpSession) -> Result<Self::Output, BindError>;

    fn describe(&self, out: &mut Vec<ParamInfo>);
}

// Route values take precedence over the query string.
fn lookup<'s>(session: &'s HttpSession, name: &str) -> Option<&'s str> {
    session
        .route_values()
        .get(name)
        .or_else(|| session.request().query_param(name))
}

/// The session itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionArg;

/// Declares a parameter that receives the [`HttpSession`].
pub fn session() -> SessionArg {
    SessionArg
}

impl Bind for SessionArg {
    type Output = HttpSession;

    fn bind(&self, session: &HttpSession) -> Result<HttpSession, BindError> {
        Ok(session.clone())
    }

    fn describe(&self, out: &mut Vec<ParamInfo>) {
        out.push(ParamInfo {
            name: "session".into(),
            source: ParamSource::Session,
            required: false,
        });
    }
}

/// A required named parameter.
pub struct Arg<T> {
    name: Cow<'static, str>,
    _type: PhantomData<fn() -> T>,
}

/// Declares a required named parameter, read from the route values or the
/// query string.
pub fn arg<T: ParamValue>(name: impl Into<Cow<'static, str>>) -> Arg<T> {
    Arg {
        name: name.into(),
        _type: PhantomData,
    }
}

impl<T: ParamValue> Arg<T> {
    /// Uses `default` when the value is absent or does not convert.
    pub fn or(self, default: T) -> WithDefault<T>
    where
        T: Clone + Sync,
    {
        WithDefault {
            name: self.name,
            default,
        }
    }

    /// Binds to `None` when the value is absent or does not convert.
    pub fn optional(self) -> Optional<T> {
        Optional {
            name: self.name,
            _type: PhantomData,
        }
    }
}

impl<T: ParamValue> Bind for Arg<T> {
    type Output = T;

    fn bind(&self, session: &HttpSession) -> Result<T, BindError> {
        let raw = lookup(session, &self.name).ok_or_else(|| BindError::Missing {
            name: self.name.to_string(),
        })?;
        T::parse_param(raw).map_err(|source| BindError::Conversion {
            name: self.name.to_string(),
            source,
        })
    }

    fn describe(&self, out: &mut Vec<ParamInfo>) {
        out.push(ParamInfo {
            name: self.name.to_string(),
            source: ParamSource::Named,
            required: true,
        });
    }
}

/// A named parameter with a declared default.
pub struct WithDefault<T> {
    name: Cow<'static, str>,
    default: T,
}

impl<T: ParamValue + Clone + Sync> Bind for WithDefault<T> {
    type Output = T;

    fn bind(&self, session: &HttpSession) -> Result<T, BindError> {
        Ok(lookup(session, &self.name)
            .and_then(|raw| T::parse_param(raw).ok())
            .unwrap_or_else(|| self.default.clone()))
    }

    fn describe(&self, out: &mut Vec<ParamInfo>) {
        out.push(ParamInfo {
            name: self.name.to_string(),
            source: ParamSource::Named,
            required: false,
        });
    }
}

/// A named parameter whose default is `None`.
pub struct Optional<T> {
    name: Cow<'static, str>,
    _type: PhantomData<fn() -> T>,
}

impl<T: ParamValue> Bind for Optional<T> {
    type Output = Option<T>;

    fn bind(&self, session: &HttpSession) -> Result<Option<T>, BindError> {
        Ok(lookup(session, &self.name).and_then(|raw| T::parse_param(raw).ok()))
    }

    fn describe(&self, out: &mut Vec<ParamInfo>) {
        out.push(ParamInfo {
            name: self.name.to_string(),
            source: ParamSource::Named,
            required: false,
        });
    }
}

/// The request body deserialized from JSON.
pub struct JsonBody<T> {
    _type: PhantomData<fn() -> T>,
}

pub fn json_body<T: DeserializeOwned + Send + 'static>() -> JsonBody<T> {
    JsonBody { _type: PhantomData }
}

impl<T: DeserializeOwned + Send + 'static> Bind for JsonBody<T> {
    type Output = T;

    fn bind(&self, session: &HttpSession) -> Result<T, BindError> {
        session.json().map_err(BindError::InvalidBody)
    }

    fn describe(&self, out: &mut Vec<ParamInfo>) {
        out.push(ParamInfo {
            name: "body".into(),
            source: ParamSource::Body,
            required: true,
        });
    }
}

/// Prepends a fresh controller instance to a descriptor tuple, so that
/// `(arg("id"),)` for controller `C` binds to `(C, id)`.
pub struct WithController<C, B> {
    binders: B,
    _controller: PhantomData<fn() -> C>,
}

impl<C, B> WithController<C, B> {
    pub(crate) fn new(binders: B) -> Self {
        Self {
            binders,
            _controller: PhantomData,
        }
    }
}

macro_rules! impl_bind_for_tuple {
    ($($param:ident)*) => {
        impl<$($param,)*> Bind for ($($param,)*)
        where
            $($param: Bind,)*
        {
            type Output = ($($param::Output,)*);

            #[allow(non_snake_case, unused_variables)]
            fn bind(&self, session: &HttpSession) -> Result<Self::Output, BindError> {
                let ($($param,)*) = self;
                Ok(($($param.bind(session)?,)*))
            }

            #[allow(non_snake_case, unused_variables)]
            fn describe(&self, out: &mut Vec<ParamInfo>) {
                let ($($param,)*) = self;
                $($param.describe(out);)*
            }
        }

        impl<Ctrl, $($param,)*> Bind for WithController<Ctrl, ($($param,)*)>
        where
            Ctrl: Controller,
            $($param: Bind,)*
        {
            type Output = (Ctrl, $($param::Output,)*);

            #[allow(non_snake_case)]
            fn bind(&self, session: &HttpSession) -> Result<Self::Output, BindError> {
                let ($($param,)*) = &self.binders;
                Ok((Ctrl::create(session), $($param.bind(session)?,)*))
            }

            #[allow(non_snake_case)]
            fn describe(&self, out: &mut Vec<ParamInfo>) {
                out.push(ParamInfo {
                    name: std::any::type_name::<Ctrl>().into(),
                    source: ParamSource::Controller,
                    required: false,
                });
                let ($($param,)*) = &self.binders;
                $($param.describe(out);)*
            }
        }
    };
}

impl_bind_for_tuple! {}
impl_bind_for_tuple! { A }
impl_bind_for_tuple! { A B }
impl_bind_for_tuple! { A B C }
impl_bind_for_tuple! { A B C D }
impl_bind_for_tuple! { A B C D E }
impl_bind_for_tuple! { A B C D E F }
impl_bind_for_tuple! { A B C D E F G }
impl_bind_for_tuple! { A B C D E F G H }
impl_bind_for_tuple! { A B C D E F G H I }
impl_bind_for_tuple! { A B C D E F G H I J }
impl_bind_for_tuple! { A B C D E F G H I J K }
impl_bind_for_tuple! { A B C D E F G H I J K L }
