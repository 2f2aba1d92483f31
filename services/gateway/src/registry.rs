//! The endpoint registry: the set of paths the host has told us it
//! understands, populated only while the host link is alive.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub http_methods: Vec<String>,
    pub remote_method: String,
    pub request_timeout: Option<f64>,
}

#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<String, EndpointInfo>,
}

impl EndpointRegistry {
    pub fn register(&mut self, path: String, info: EndpointInfo) {
        self.endpoints.insert(path, info);
    }

    pub fn get(&self, path: &str) -> Option<&EndpointInfo> {
        self.endpoints.get(path)
    }

    pub fn clear(&mut self) {
        self.endpoints.clear();
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_endpoint_is_none() {
        let reg = EndpointRegistry::default();
        assert!(reg.get("/printer/gcode").is_none());
    }

    #[test]
    fn clear_removes_all_registrations() {
        let mut reg = EndpointRegistry::default();
        reg.register(
            "/printer/gcode".to_owned(),
            EndpointInfo {
                http_methods: vec!["POST".to_owned()],
                remote_method: "gcode.run".to_owned(),
                request_timeout: None,
            },
        );
        assert!(reg.get("/printer/gcode").is_some());
        reg.clear();
        assert!(reg.get("/printer/gcode").is_none());
    }
}
