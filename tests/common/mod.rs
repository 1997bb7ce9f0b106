//! Shared fixtures: a hand-built `demo` descriptor pool and an in-process
//! transport that records every call.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use grpc_stitch_gateway::{
    Gateway, GatewayBuilder, MessageStream, RelationConfig, ServiceOptions, SharedTransport,
    Transport,
};
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor, ReflectMessage};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet, MessageOptions, MethodDescriptorProto, MethodOptions,
    ServiceDescriptorProto,
};
use serde_json::{json, Value as Json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tonic::metadata::MetadataMap;
use tonic::Status;

pub const GET_USER: &str = "demo.UserService.GetUser";
pub const LIST_USERS: &str = "demo.UserService.ListUsers";
pub const UPDATE_USER: &str = "demo.UserService.UpdateUser";
pub const WATCH_USERS: &str = "demo.UserService.WatchUsers";
pub const SYNC_USERS: &str = "demo.UserService.SyncUsers";
pub const GET_TEAMS: &str = "demo.RelationService.GetTeams";
pub const GET_BADGES: &str = "demo.RelationService.GetBadges";
pub const GET_TEAM_LEADS: &str = "demo.RelationService.GetTeamLeads";

fn field(name: &str, number: i32, ty: Type, type_name: Option<&str>) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        type_name: type_name.map(str::to_string),
        ..Default::default()
    }
}

fn repeated(name: &str, number: i32, ty: Type, type_name: Option<&str>) -> FieldDescriptorProto {
    FieldDescriptorProto {
        label: Some(Label::Repeated as i32),
        ..field(name, number, ty, type_name)
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

/// `repeated Result values = 1; message Result { <value> = 1; }`
fn relation_response(name: &str, value: FieldDescriptorProto) -> DescriptorProto {
    DescriptorProto {
        nested_type: vec![message("Result", vec![value])],
        ..message(
            name,
            vec![repeated(
                "values",
                1,
                Type::Message,
                Some(&format!(".demo.{name}.Result")),
            )],
        )
    }
}

fn method(
    name: &str,
    input: &str,
    output: &str,
    client_streaming: bool,
    server_streaming: bool,
    side_effect_free: bool,
) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".demo.{input}")),
        output_type: Some(format!(".demo.{output}")),
        client_streaming: Some(client_streaming),
        server_streaming: Some(server_streaming),
        options: side_effect_free.then(|| MethodOptions {
            // NO_SIDE_EFFECTS
            idempotency_level: Some(1),
            ..Default::default()
        }),
    }
}

fn demo_file() -> FileDescriptorProto {
    let user = DescriptorProto {
        nested_type: vec![DescriptorProto {
            options: Some(MessageOptions {
                map_entry: Some(true),
                ..Default::default()
            }),
            ..message(
                "ScoresEntry",
                vec![
                    field("key", 1, Type::String, None),
                    field("value", 2, Type::Int64, None),
                ],
            )
        }],
        ..message(
            "User",
            vec![
                field("id", 1, Type::String, None),
                field("name", 2, Type::String, None),
                field("manager", 3, Type::Message, Some(".demo.User")),
                repeated("tags", 4, Type::String, None),
                repeated("scores", 5, Type::Message, Some(".demo.User.ScoresEntry")),
                field("status", 6, Type::Enum, Some(".demo.Status")),
                field("karma", 7, Type::Int64, None),
                field("display_name", 8, Type::String, None),
            ],
        )
    };

    let status = EnumDescriptorProto {
        name: Some("Status".to_string()),
        value: vec![
            EnumValueDescriptorProto {
                name: Some("STATUS_UNKNOWN".to_string()),
                number: Some(0),
                ..Default::default()
            },
            EnumValueDescriptorProto {
                name: Some("STATUS_ACTIVE".to_string()),
                number: Some(1),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some("demo.proto".to_string()),
        package: Some("demo".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            user,
            message(
                "Team",
                vec![
                    field("id", 1, Type::String, None),
                    field("title", 2, Type::String, None),
                ],
            ),
            message("GetUserRequest", vec![field("id", 1, Type::String, None)]),
            message("ListUsersRequest", vec![]),
            message(
                "ListUsersResponse",
                vec![repeated("users", 1, Type::Message, Some(".demo.User"))],
            ),
            message(
                "UpdateUserRequest",
                vec![
                    field("id", 1, Type::String, None),
                    field("name", 2, Type::String, None),
                ],
            ),
            message("WatchUsersRequest", vec![field("count", 1, Type::Int32, None)]),
            message(
                "GetTeamsRequest",
                vec![
                    repeated("bases", 1, Type::Message, Some(".demo.User")),
                    field("filter", 2, Type::String, None),
                ],
            ),
            relation_response(
                "GetTeamsResponse",
                field("team", 1, Type::Message, Some(".demo.Team")),
            ),
            message(
                "GetBadgesRequest",
                vec![repeated("bases", 1, Type::Message, Some(".demo.User"))],
            ),
            relation_response("GetBadgesResponse", field("badge", 1, Type::String, None)),
            message(
                "GetTeamLeadsRequest",
                vec![repeated("bases", 1, Type::Message, Some(".demo.Team"))],
            ),
            relation_response(
                "GetTeamLeadsResponse",
                field("lead", 1, Type::Message, Some(".demo.User")),
            ),
            message(
                "BadRelationRequest",
                vec![field("bases", 1, Type::Message, Some(".demo.User"))],
            ),
        ],
        enum_type: vec![status],
        service: vec![
            ServiceDescriptorProto {
                name: Some("UserService".to_string()),
                method: vec![
                    method("GetUser", "GetUserRequest", "User", false, false, true),
                    method("ListUsers", "ListUsersRequest", "ListUsersResponse", false, false, true),
                    method("UpdateUser", "UpdateUserRequest", "User", false, false, false),
                    method("WatchUsers", "WatchUsersRequest", "User", false, true, false),
                    method("SyncUsers", "User", "User", true, true, false),
                ],
                ..Default::default()
            },
            ServiceDescriptorProto {
                name: Some("RelationService".to_string()),
                method: vec![
                    method("GetTeams", "GetTeamsRequest", "GetTeamsResponse", false, false, true),
                    method("GetBadges", "GetBadgesRequest", "GetBadgesResponse", false, false, true),
                    method(
                        "GetTeamLeads",
                        "GetTeamLeadsRequest",
                        "GetTeamLeadsResponse",
                        false,
                        false,
                        true,
                    ),
                    method("BadRelation", "BadRelationRequest", "GetBadgesResponse", false, false, true),
                    method("StreamTeams", "GetTeamsRequest", "GetTeamsResponse", false, true, false),
                ],
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

pub fn pool() -> DescriptorPool {
    DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
        file: vec![demo_file()],
    })
    .expect("demo descriptors are valid")
}

pub fn method_desc(pool: &DescriptorPool, full_name: &str) -> MethodDescriptor {
    let (service, method) = full_name.rsplit_once('.').expect("qualified method");
    pool.get_service_by_name(service)
        .and_then(|s| s.methods().find(|m| m.name() == method))
        .unwrap_or_else(|| panic!("method {full_name} not in pool"))
}

/// Build a message of type `name` from proto-JSON.
pub fn msg(pool: &DescriptorPool, name: &str, json: Json) -> DynamicMessage {
    let desc = pool
        .get_message_by_name(name)
        .unwrap_or_else(|| panic!("message {name} not in pool"));
    DynamicMessage::deserialize(desc, json).expect("valid proto-JSON")
}

/// Proto-JSON of a message, for assertions.
pub fn to_json(message: &DynamicMessage) -> Json {
    serde_json::to_value(message).expect("serializable")
}

pub fn str_field(message: &DynamicMessage, name: &str) -> String {
    message
        .get_field_by_name(name)
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

pub fn users() -> Json {
    json!({
        "u1": {
            "id": "u1",
            "name": "Ada",
            "manager": {"id": "u2", "name": "Grace"},
            "tags": ["admin", "ops"],
            "scores": {"b": "2", "a": "1"},
            "status": "STATUS_ACTIVE",
            "karma": "42",
            "displayName": "ada"
        },
        "u2": {"id": "u2", "name": "Grace", "status": "STATUS_ACTIVE"},
        "u3": {"id": "u3", "name": "Linus"}
    })
}

/// One recorded downstream call.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub message: DynamicMessage,
    pub metadata: MetadataMap,
}

impl Call {
    /// Values of `stitch-operations`, in order.
    pub fn operations(&self) -> Vec<String> {
        self.metadata
            .get_all("stitch-operations")
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.metadata
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// The decoded `grpc-timeout` the call was sent with.
    pub fn timeout(&self) -> Option<Duration> {
        grpc_stitch_gateway::headers::parse_timeout(&self.metadata.clone().into_headers())
    }
}

type UnaryHandler =
    Arc<dyn Fn(&DescriptorPool, DynamicMessage) -> Result<DynamicMessage, Status> + Send + Sync>;
type StreamHandler = Arc<
    dyn Fn(&DescriptorPool, DynamicMessage) -> Result<Vec<Result<DynamicMessage, Status>>, Status>
        + Send
        + Sync,
>;

/// In-process transport dispatching to closures by method name.
pub struct MockTransport {
    pool: DescriptorPool,
    unary: Mutex<HashMap<String, UnaryHandler>>,
    streaming: Mutex<HashMap<String, StreamHandler>>,
    calls: Mutex<Vec<Call>>,
    hanging: Mutex<HashSet<String>>,
    held: Mutex<Vec<oneshot::Receiver<()>>>,
}

impl MockTransport {
    pub fn new(pool: DescriptorPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            unary: Mutex::new(HashMap::new()),
            streaming: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hanging: Mutex::new(HashSet::new()),
            held: Mutex::new(Vec::new()),
        })
    }

    /// Make unary calls to `method` never complete.
    pub fn hang(&self, method: &str) {
        self.hanging.lock().unwrap().insert(method.to_string());
    }

    /// One receiver per hung call. Its sender lives inside the call future,
    /// so the receiver reports closed once that future is dropped.
    pub fn take_held(&self) -> Vec<oneshot::Receiver<()>> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }

    pub fn on_unary<F>(&self, method: &str, handler: F)
    where
        F: Fn(&DescriptorPool, DynamicMessage) -> Result<DynamicMessage, Status>
            + Send
            + Sync
            + 'static,
    {
        self.unary
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn on_stream<F>(&self, method: &str, handler: F)
    where
        F: Fn(&DescriptorPool, DynamicMessage) -> Result<Vec<Result<DynamicMessage, Status>>, Status>
            + Send
            + Sync
            + 'static,
    {
        self.streaming
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }

    fn record(&self, method: &MethodDescriptor, request: tonic::Request<DynamicMessage>) -> DynamicMessage {
        let (metadata, _, message) = request.into_parts();
        self.calls.lock().unwrap().push(Call {
            method: method.full_name().to_string(),
            message: message.clone(),
            metadata,
        });
        message
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> Result<tonic::Response<DynamicMessage>, Status> {
        let message = self.record(method, request);
        let hang = self.hanging.lock().unwrap().contains(method.full_name());
        if hang {
            let (sender, receiver) = oneshot::channel::<()>();
            self.held.lock().unwrap().push(receiver);
            let _sender = sender;
            futures::future::pending::<()>().await;
        }
        let handler = self.unary.lock().unwrap().get(method.full_name()).cloned();
        let handler = handler.ok_or_else(|| Status::unimplemented(method.full_name().to_string()))?;
        let response = handler(&self.pool, message)?;
        assert_eq!(
            response.descriptor(),
            method.output(),
            "handler for {} returned the wrong type",
            method.full_name()
        );
        Ok(tonic::Response::new(response))
    }

    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> Result<tonic::Response<MessageStream>, Status> {
        let message = self.record(method, request);
        let handler = self.streaming.lock().unwrap().get(method.full_name()).cloned();
        let handler = handler.ok_or_else(|| Status::unimplemented(method.full_name().to_string()))?;
        let items = handler(&self.pool, message)?;
        Ok(tonic::Response::new(futures::stream::iter(items).boxed()))
    }
}

/// Install the default demo behaviour on `transport`.
pub fn install_demo_handlers(transport: &MockTransport) {
    transport.on_unary(GET_USER, |pool, req| {
        let id = str_field(&req, "id");
        match users().get(&id) {
            Some(user) => Ok(msg(pool, "demo.User", user.clone())),
            None => Err(Status::not_found(format!("user {id} not found"))),
        }
    });
    transport.on_unary(LIST_USERS, |pool, _| {
        let all = users();
        let list: Vec<Json> = ["u1", "u2", "u3"].iter().map(|id| all[*id].clone()).collect();
        Ok(msg(pool, "demo.ListUsersResponse", json!({"users": list})))
    });
    transport.on_unary(UPDATE_USER, |pool, req| {
        Ok(msg(
            pool,
            "demo.User",
            json!({"id": str_field(&req, "id"), "name": str_field(&req, "name")}),
        ))
    });
    transport.on_stream(WATCH_USERS, |pool, _| {
        Ok((1..=5)
            .map(|i| Ok(msg(pool, "demo.User", json!({"id": format!("w{i}"), "name": format!("watcher {i}")}))))
            .collect())
    });
    transport.on_unary(GET_TEAMS, |pool, req| {
        let filter = str_field(&req, "filter");
        let values: Vec<Json> = bases(&req)
            .iter()
            .map(|base| {
                json!({"team": {
                    "id": format!("team-{}", str_field(base, "id")),
                    "title": format!("{}:{}", filter, str_field(base, "name")),
                }})
            })
            .collect();
        Ok(msg(pool, "demo.GetTeamsResponse", json!({"values": values})))
    });
    transport.on_unary(GET_BADGES, |pool, req| {
        let values: Vec<Json> = bases(&req)
            .iter()
            .map(|base| match str_field(base, "id").as_str() {
                "u3" => json!({}),
                id => json!({"badge": format!("badge-{id}")}),
            })
            .collect();
        Ok(msg(pool, "demo.GetBadgesResponse", json!({"values": values})))
    });
    transport.on_unary(GET_TEAM_LEADS, |pool, req| {
        let values: Vec<Json> = bases(&req)
            .iter()
            .map(|base| json!({"lead": {"id": format!("lead-{}", str_field(base, "id")), "name": "Lead"}}))
            .collect();
        Ok(msg(pool, "demo.GetTeamLeadsResponse", json!({"values": values})))
    });
}

/// The `bases` of a relation request.
pub fn bases(request: &DynamicMessage) -> Vec<DynamicMessage> {
    request
        .get_field_by_name("bases")
        .and_then(|v| {
            v.as_list().map(|list| {
                list.iter()
                    .filter_map(|item| item.as_message().cloned())
                    .collect()
            })
        })
        .unwrap_or_default()
}

/// Builder with `UserService` entry points and the `team`, `badge` and
/// `lead` relations, all backed by `transport`.
pub fn demo_builder(pool: &DescriptorPool, transport: SharedTransport) -> GatewayBuilder {
    let users = pool.get_service_by_name("demo.UserService").unwrap();
    let relations = pool.get_service_by_name("demo.RelationService").unwrap();
    Gateway::builder()
        .with_transport(transport)
        .register_service(&users, ServiceOptions::new())
        .unwrap()
        .register_relation(
            &relations,
            [
                ("GetTeams", RelationConfig::new("team")),
                ("GetBadges", RelationConfig::new("badge")),
                ("GetTeamLeads", RelationConfig::new("lead")),
            ],
        )
        .unwrap()
}

/// A gateway over the demo handlers.
pub fn demo_gateway() -> (Gateway, Arc<MockTransport>) {
    let pool = pool();
    let transport = MockTransport::new(pool.clone());
    install_demo_handlers(&transport);
    let gateway = demo_builder(&pool, transport.clone()).build().unwrap();
    (gateway, transport)
}

/// Keys of a JSON object, sorted.
pub fn keys(value: &Json) -> Vec<String> {
    let mut keys: Vec<String> = value
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}
