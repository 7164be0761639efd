pub(crate) const PROBLEM_INTERNAL: &str = "https://waffleconf.dev/problems/internal";
pub(crate) const PROBLEM_BAD_REQUEST: &str = "https://waffleconf.dev/problems/bad-request";
pub(crate) const PROBLEM_CONFIG_INVALID: &str = "https://waffleconf.dev/problems/config-invalid";
pub(crate) const PROBLEM_UNSUPPORTED_MEDIA: &str =
    "https://waffleconf.dev/problems/unsupported-media-type";

pub(crate) const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub(crate) const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";
