//! Requests sent to the remote application over the data channel.

use serde_json::{json, Map, Value};

/// A structured request. Every variant shares the same envelope and only
/// differs in its tag and field set.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    /// Location, rotation and velocity of one agent
    Transform { agent_id: i64 },
    /// Line trace from an agent's viewpoint
    Raycast { agent_id: i64 },
    /// Runs a console command in the remote application
    ConsoleCommand { command: String },
    /// Changes the streamed video resolution
    Resolution { width: u32, height: u32 },
    /// Calls a named function on an agent
    CallFunction {
        run_on_server: bool,
        agent_id: i64,
        function: String,
        parameters: Vec<String>,
    },
    /// Snapshot of every agent in the world
    GetWorld,
    /// Agent id of the locally controlled pawn
    LocalId,
}

impl OutboundRequest {
    pub fn console(command: impl Into<String>) -> Self {
        OutboundRequest::ConsoleCommand {
            command: command.into(),
        }
    }

    pub fn call_function<I, S>(
        run_on_server: bool,
        agent_id: i64,
        function: &str,
        parameters: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OutboundRequest::CallFunction {
            run_on_server,
            agent_id,
            function: function.to_string(),
            parameters: parameters.into_iter().map(Into::into).collect(),
        }
    }

    /// The `dataType` tag the remote side dispatches on.
    pub fn data_type(&self) -> &'static str {
        match self {
            OutboundRequest::Transform { .. } => "Transform",
            OutboundRequest::Raycast { .. } => "Raycast",
            OutboundRequest::ConsoleCommand { .. } => "ConsoleCommand",
            OutboundRequest::Resolution { .. } => "PixResolution",
            OutboundRequest::CallFunction { .. } => "CallFunction",
            OutboundRequest::GetWorld => "GetWorld",
            OutboundRequest::LocalId => "LocalID",
        }
    }

    fn agent_id(&self) -> i64 {
        match self {
            OutboundRequest::Transform { agent_id }
            | OutboundRequest::Raycast { agent_id }
            | OutboundRequest::CallFunction { agent_id, .. } => *agent_id,
            _ => 0,
        }
    }

    fn run_on_server(&self) -> bool {
        matches!(
            self,
            OutboundRequest::CallFunction {
                run_on_server: true,
                ..
            }
        )
    }

    /// The variant specific part of `data`.
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        match self {
            OutboundRequest::ConsoleCommand { command } => {
                fields.insert("commandString".into(), json!(command));
            }
            OutboundRequest::Resolution { width, height } => {
                fields.insert(
                    "commandString".into(),
                    json!(format!(
                        "PixelStreaming.Encoder.TargetSize {}x{}",
                        width, height
                    )),
                );
            }
            OutboundRequest::CallFunction {
                function,
                parameters,
                ..
            } => {
                let mut call = function.clone();
                for p in parameters {
                    call.push(' ');
                    call.push_str(p);
                }
                fields.insert("functionString".into(), json!(call));
            }
            _ => {}
        }
        fields
    }

    /// Builds the full wire envelope for this request.
    pub fn envelope(&self, message_id: u64, has_callback: bool) -> Value {
        let mut data = Map::new();
        data.insert("callback".into(), json!(has_callback));
        data.insert("messageID".into(), json!(message_id));
        data.insert("bRunonServer".into(), json!(self.run_on_server()));
        data.insert("agentID".into(), json!(self.agent_id()));
        data.extend(self.fields());

        json!({
            "dataType": self.data_type(),
            "data": Value::Object(data),
            "messageID": message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_world_envelope() {
        let env = OutboundRequest::GetWorld.envelope(0, true);
        assert_eq!(env["dataType"], "GetWorld");
        assert_eq!(env["messageID"], 0);
        assert_eq!(env["data"]["messageID"], 0);
        assert_eq!(env["data"]["callback"], true);
        assert_eq!(env["data"]["agentID"], 0);
        assert_eq!(env["data"]["bRunonServer"], false);
    }

    #[test]
    fn resolution_becomes_console_command() {
        let req = OutboundRequest::Resolution {
            width: 1280,
            height: 720,
        };
        let env = req.envelope(4, false);
        assert_eq!(env["dataType"], "PixResolution");
        assert_eq!(
            env["data"]["commandString"],
            "PixelStreaming.Encoder.TargetSize 1280x720"
        );
    }

    #[test]
    fn call_function_joins_parameters() {
        let req = OutboundRequest::call_function(true, 7, "SetSpeed", ["10", "fast"]);
        let env = req.envelope(1, false);
        assert_eq!(env["data"]["functionString"], "SetSpeed 10 fast");
        assert_eq!(env["data"]["agentID"], 7);
        assert_eq!(env["data"]["bRunonServer"], true);
    }

    #[test]
    fn agent_requests_carry_agent_id() {
        let env = OutboundRequest::Raycast { agent_id: 3 }.envelope(2, true);
        assert_eq!(env["dataType"], "Raycast");
        assert_eq!(env["data"]["agentID"], 3);
        assert_eq!(OutboundRequest::LocalId.data_type(), "LocalID");
    }
}
