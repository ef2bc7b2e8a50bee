use secrecy::SecretString;
use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 320, message = "Identifier is required"))]
    pub identifier: String,

    #[validate(length(min = 1, max = 16))]
    pub lang: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyCodeRequest {
    #[validate(length(min = 1, max = 128, message = "Flow id is required"))]
    pub flow_id: String,

    #[validate(length(min = 4, max = 16, message = "Code must be 4 to 16 characters"))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 320, message = "Identifier is required"))]
    pub identifier: String,

    /// Absent for one-time-code login.
    pub password: Option<SecretString>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EmailChallengeRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PhoneChallengeRequest {
    #[validate(length(min = 8, max = 20, message = "Invalid phone number"))]
    pub phone: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IdentifierRequest {
    #[validate(length(min = 1, max = 320, message = "Identifier is required"))]
    pub identifier: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateLangRequest {
    #[validate(length(min = 1, max = 16, message = "Language is required"))]
    pub lang: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_request_rejects_short_codes() {
        let req = VerifyCodeRequest {
            flow_id: "flow".to_string(),
            code: "12".to_string(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn login_password_is_optional() {
        let req: LoginRequest =
            serde_json::from_str(r#"{"identifier":"a@example.com"}"#).unwrap();
        assert!(req.password.is_none());
        assert!(req.validate().is_ok());
    }
}
