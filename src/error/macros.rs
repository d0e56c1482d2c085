//! # 错误处理宏

/// 以格式化消息构造带 `message`/`source` 字段的错误变体
#[macro_export]
macro_rules! error {
    ($variant:ident, $msg:expr) => {
        $crate::error::GatewayError::$variant {
            message: ($msg).to_string(),
            source: None,
        }
    };
    ($variant:ident, $fmt:expr, $($arg:tt)*) => {
        $crate::error::GatewayError::$variant {
            message: format!($fmt, $($arg)*),
            source: None,
        }
    };
}

/// 立即返回错误
#[macro_export]
macro_rules! bail {
    ($variant:ident, $($arg:tt)*) => {
        return Err($crate::error!($variant, $($arg)*))
    };
}

/// 条件不成立时返回错误
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $variant:ident, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($variant, $($arg)*);
        }
    };
}
