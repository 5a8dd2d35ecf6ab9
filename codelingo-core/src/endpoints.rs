//! REST endpoint catalog.
//!
//! Paths are relative to `{api_url}/{api_version}`; the dispatcher resolves
//! them against the configured base.

pub mod auth {
    pub const LOGIN: &str = "/auth/login";
    pub const REGISTER: &str = "/auth/register";
    pub const LOGOUT: &str = "/auth/logout";
    pub const REFRESH: &str = "/auth/refresh";
    pub const PROFILE: &str = "/auth/profile";
    pub const FORGOT_PASSWORD: &str = "/auth/forgot-password";
    pub const RESET_PASSWORD: &str = "/auth/reset-password";
    pub const VERIFY_EMAIL: &str = "/auth/verify-email";
}

pub mod users {
    pub const PROFILE: &str = "/users/profile";
    pub const CHANGE_PASSWORD: &str = "/users/change-password";
    pub const PREFERENCES: &str = "/users/preferences";
    pub const PROGRESS: &str = "/users/progress";
    pub const ACHIEVEMENTS: &str = "/users/achievements";
    pub const STREAK: &str = "/users/streak";
}

pub mod courses {
    pub const LIST: &str = "/courses";

    pub fn details(course_id: &str) -> String {
        format!("/courses/{}", course_id)
    }

    pub fn enroll(course_id: &str) -> String {
        format!("/courses/{}/enroll", course_id)
    }

    pub fn unenroll(course_id: &str) -> String {
        format!("/courses/{}/unenroll", course_id)
    }

    pub fn progress(course_id: &str) -> String {
        format!("/courses/{}/progress", course_id)
    }

    pub fn reviews(course_id: &str) -> String {
        format!("/courses/{}/reviews", course_id)
    }

    pub fn modules(course_id: &str) -> String {
        format!("/courses/{}/modules", course_id)
    }

    pub fn module_details(course_id: &str, module_id: &str) -> String {
        format!("/courses/{}/modules/{}", course_id, module_id)
    }

    pub fn lessons(course_id: &str, module_id: &str) -> String {
        format!("/courses/{}/modules/{}/lessons", course_id, module_id)
    }

    pub fn lesson_details(course_id: &str, module_id: &str, lesson_id: &str) -> String {
        format!(
            "/courses/{}/modules/{}/lessons/{}",
            course_id, module_id, lesson_id
        )
    }

    pub fn complete_lesson(course_id: &str, module_id: &str, lesson_id: &str) -> String {
        format!(
            "/courses/{}/modules/{}/lessons/{}/complete",
            course_id, module_id, lesson_id
        )
    }
}

pub mod progress {
    pub const OVERVIEW: &str = "/progress/overview";
    pub const COURSES: &str = "/progress/courses";
    pub const UPDATE: &str = "/progress/update";
    pub const STATS: &str = "/progress/stats";

    pub fn course(course_id: &str) -> String {
        format!("/progress/courses/{}", course_id)
    }
}

pub mod system {
    pub const HEALTH: &str = "/health";
    pub const VERSION: &str = "/version";
    pub const STATUS: &str = "/status";
}

/// Build a `?k=v&...` query string, skipping absent values.
/// Returns an empty string when nothing remains.
pub fn build_query_string<K, V>(params: &[(K, Option<V>)]) -> String
where
    K: AsRef<str>,
    V: ToString,
{
    let pairs: Vec<String> = params
        .iter()
        .filter_map(|(key, value)| {
            value.as_ref().map(|value| {
                format!(
                    "{}={}",
                    urlencoding::encode(key.as_ref()),
                    urlencoding::encode(&value.to_string())
                )
            })
        })
        .collect();
    if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", pairs.join("&"))
    }
}

/// Append a query string to an endpoint path.
pub fn with_query<K, V>(endpoint: &str, params: &[(K, Option<V>)]) -> String
where
    K: AsRef<str>,
    V: ToString,
{
    format!("{}{}", endpoint, build_query_string(params))
}
