pub const TOPIC_CONTROLLER_STATE: &str = "fancontrol/controller/state";
