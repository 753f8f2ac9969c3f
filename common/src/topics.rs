pub const TOPIC_CONTROLLER_STATE: &str = "heater/controller/state";

pub const TOPIC_CMD_RODS: &str = "heater/cmnd/rods";
