// Navigation hook
// The session core only asks for redirects; the host application performs them

/// Unauthenticated entry point shown after logout
pub const LOGIN_ROUTE: &str = "/login";

/// Redirect facility provided by the host application
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: &str);
}

/// Navigator for hosts without a router: records the request in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, route: &str) {
        tracing::info!(route, "Navigation requested");
    }
}
