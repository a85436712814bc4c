mod handler;
mod model;

pub use handler::{
    check_token,
    login,
    refresh_token,
    register,
    reset_password,
    update_password
};
pub use model::{TelegramLink, User, UserStore};
