//! gRPC service reconstruction.
//!
//! The gRPC C# plugin emits one static holder class per service with two
//! nested classes: an abstract server base (`XBase`) and a concrete client
//! (`XClient`). Either one describes the whole service, through different
//! method shapes:
//!
//! | call kind | client return type | server signature |
//! |---|---|---|
//! | unary | `Resp` | `Task<Resp> M(Req, ServerCallContext)` |
//! | server streaming | `AsyncServerStreamingCall<Resp>` | `Task M(Req, IServerStreamWriter<Resp>, ..)` |
//! | client streaming | `AsyncClientStreamingCall<Req, Resp>` | `Task<Resp> M(IAsyncStreamReader<Req>, ..)` |
//! | bidi streaming | `AsyncDuplexStreamingCall<Req, Resp>` | `Task M(IAsyncStreamReader<Req>, IServerStreamWriter<Resp>, ..)` |

use super::{has_attribute, is_grpc_generated, is_static_holder, Decompiler, ParseOptions, OBSOLETE_ATTRIBUTE};
use crate::error::{Error, Result};
use crate::metadata::{CilMethod, CilType};
use crate::proto::{Service, ServiceMethod, TopLevelId, TopLevelKind};
use tracing::{debug, debug_span, trace};

const UNARY_ASYNC_CALL: &str = "AsyncUnaryCall`1";
const DUPLEX_STREAMING_CALL: &str = "AsyncDuplexStreamingCall`2";

/// Request and response of one method, before type resolution
struct MethodShape<T> {
    request: T,
    response: T,
    request_streamed: bool,
    response_streamed: bool,
}

impl Decompiler {
    /// Reconstructs a gRPC service.
    ///
    /// `ty` may be the static holder class, its client class or its server
    /// base class. Client and server of one holder yield the same service.
    pub fn parse_service<T: CilType>(&mut self, ty: &T, options: ParseOptions) -> Result<TopLevelId> {
        let (holder, implementation, is_client) = classify(ty)?;
        if let Some(id) = self.lookup(holder.full_name()) {
            return Ok(id);
        }

        let _span = debug_span!("service", name = holder.full_name(), is_client).entered();
        let name = self.translator().type_name(holder.name());
        let is_obsolete = has_attribute(&holder.custom_attributes()?, OBSOLETE_ATTRIBUTE);
        let id = self
            .schema
            .add_top_level(name, is_obsolete, TopLevelKind::Service(Service::default()));
        self.memo.insert(holder.full_name().to_owned(), id);
        let file = self.new_file(&holder);
        self.schema.attach(id, file);

        let mut service = Service::default();
        for method in implementation.methods() {
            if method.is_inherited() || !method.is_public() || method.is_static() || method.is_constructor() {
                continue;
            }
            let attributes = method.custom_attributes()?;
            if !options.include_service_methods_without_generated_code_attribute
                && !is_grpc_generated(&attributes)?
            {
                trace!(method = method.name(), "skipping unmarked method");
                continue;
            }

            let shape = if is_client {
                match client_method_shape(&implementation, &method)? {
                    Some(shape) => shape,
                    None => continue,
                }
            } else {
                server_method_shape(&implementation, &method)?
            };

            let method_name = self.translator().type_name(method.name());
            if service.has_method(&method_name) {
                trace!(method = method.name(), "skipping call overload");
                continue;
            }

            let request = self.resolve_field_type(&shape.request, id, options)?;
            let response = self.resolve_field_type(&shape.response, id, options)?;
            service.methods.push(ServiceMethod {
                name: method_name,
                request,
                response,
                request_streamed: shape.request_streamed,
                response_streamed: shape.response_streamed,
                is_obsolete: has_attribute(&attributes, OBSOLETE_ATTRIBUTE),
            });
        }

        debug!(methods = service.methods.len(), "service reconstructed");
        if let TopLevelKind::Service(slot) = &mut self.schema.top_level_mut(id).kind {
            *slot = service;
        }
        Ok(id)
    }
}

/// Splits the input into (holder, class whose methods are read, is client)
fn classify<T: CilType>(ty: &T) -> Result<(T, T, bool)> {
    if is_static_holder(ty) {
        let nested = ty.nested_types();
        if let Some(server) = nested.iter().find(|n| n.is_abstract() && !n.is_sealed()) {
            return Ok((ty.clone(), server.clone(), false));
        }
        if let Some(client) = nested.iter().find(|n| n.is_class() && !n.is_abstract()) {
            return Ok((ty.clone(), client.clone(), true));
        }
        return Err(Error::precondition(
            ty.full_name(),
            "service holder declares neither a server base nor a client",
        ));
    }

    match ty.declaring_type() {
        Some(holder) => Ok((holder, ty.clone(), !ty.is_abstract())),
        None => Err(Error::precondition(
            ty.full_name(),
            "service classes must be nested in their static holder",
        )),
    }
}

fn missing_parameter<T: CilType>(service: &T, method: &str, what: &str) -> Error {
    Error::precondition(
        service.full_name(),
        format!("method '{}' has no {} parameter", method, what),
    )
}

/// Decodes a client call method; `None` for the async duplicate of a unary call
fn client_method_shape<T, M>(client: &T, method: &M) -> Result<Option<MethodShape<T>>>
where
    T: CilType,
    M: CilMethod<Type = T>,
{
    let return_type = method.return_type();
    if return_type.name() == UNARY_ASYNC_CALL {
        return Ok(None);
    }

    let mut arguments = return_type.generic_type_arguments().into_iter();
    let first_parameter = || {
        method
            .parameter_types()
            .into_iter()
            .next()
            .ok_or_else(|| missing_parameter(client, method.name(), "request"))
    };

    let shape = match (arguments.next(), arguments.next(), arguments.next()) {
        (Some(request), Some(response), None) => MethodShape {
            request,
            response,
            request_streamed: true,
            response_streamed: return_type.name() == DUPLEX_STREAMING_CALL,
        },
        (Some(response), None, None) => MethodShape {
            request: first_parameter()?,
            response,
            request_streamed: false,
            response_streamed: true,
        },
        (None, None, None) => MethodShape {
            request: first_parameter()?,
            response: return_type.clone(),
            request_streamed: false,
            response_streamed: false,
        },
        _ => {
            return Err(Error::precondition(
                client.full_name(),
                format!("method '{}' returns an unrecognised call type", method.name()),
            ))
        }
    };
    Ok(Some(shape))
}

/// Decodes a server base method
fn server_method_shape<T, M>(server: &T, method: &M) -> Result<MethodShape<T>>
where
    T: CilType,
    M: CilMethod<Type = T>,
{
    let mut parameters = method.parameter_types().into_iter();
    let request_parameter = parameters
        .next()
        .ok_or_else(|| missing_parameter(server, method.name(), "request"))?;

    let (request, request_streamed) = match single_argument(&request_parameter) {
        Some(element) => (element, true),
        None => (request_parameter, false),
    };

    let (response, response_streamed) = match single_argument(&method.return_type()) {
        Some(response) => (response, false),
        None => {
            let writer = parameters
                .next()
                .and_then(|p| single_argument(&p))
                .ok_or_else(|| missing_parameter(server, method.name(), "response writer"))?;
            (writer, true)
        }
    };

    Ok(MethodShape {
        request,
        response,
        request_streamed,
        response_streamed,
    })
}

fn single_argument<T: CilType>(ty: &T) -> Option<T> {
    let mut arguments = ty.generic_type_arguments();
    (arguments.len() == 1).then(|| arguments.remove(0))
}
