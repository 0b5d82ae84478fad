pub mod cookies;
pub(crate) mod extractors;
pub mod jwt;
pub mod password;

pub use extractors::AuthClaims;
pub use jwt::{Claims, TokenIssuer, TokenPair, TokenType};
