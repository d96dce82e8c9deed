//! Logging macros that compile to nothing unless the `log` feature is enabled.

macro_rules! trace {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::trace!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false {
            let _ = ::core::format_args!($($tt)*);
        }
    }};
}

macro_rules! debug {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::debug!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false {
            let _ = ::core::format_args!($($tt)*);
        }
    }};
}

macro_rules! warning {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::warn!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false {
            let _ = ::core::format_args!($($tt)*);
        }
    }};
}

pub(crate) use {debug, trace, warning};

#[cfg(test)]
mod tests {
    extern crate std;
    use std::string::String;

    #[test]
    fn test_macros_accept_temporary_arguments() {
        // arguments creating temporaries must be accepted by the disabled arm
        let payload = String::from("payload");
        trace!("got {}", payload.clone());
        debug!("len {}", payload.len() + 1);
        warning!("upper {}", payload.to_uppercase());
    }
}
