#[macro_export]
macro_rules! spanned {
    ($name:expr, $code:block) => {{
        // Block: can short circuit outer function
        let _entered_span = $crate::tracing::trace_span!($name).entered();
        $code
    }};
    ($name:expr, || $code:block) => {{
        // Closure: cannot short circuit outer function
        let _entered_span = $crate::tracing::trace_span!($name).entered();
        (|| $code)()
    }};
}

#[macro_export]
macro_rules! tagged_event {
    ($level:ident, $event_tag:path, $($arg:tt)*) => {{
        fn assert_eventtag(_: &$crate::EventTag) {}
        assert_eventtag(&$event_tag);
        let event_tag_id: u64 = $event_tag.into();
        $crate::tracing::event!($crate::tracing::Level::$level, event_tag_id, $($arg)*)
    }}
}

#[macro_export]
macro_rules! admin_debug {
    ($($arg:tt)*) => { $crate::tagged_event!(DEBUG, $crate::EventTag::AdminDebug, $($arg)*) }
}

#[macro_export]
macro_rules! admin_error {
    ($($arg:tt)*) => { $crate::tagged_event!(ERROR, $crate::EventTag::AdminError, $($arg)*) }
}

#[macro_export]
macro_rules! admin_warn {
    ($($arg:tt)*) => { $crate::tagged_event!(WARN, $crate::EventTag::AdminWarn, $($arg)*) }
}

#[macro_export]
macro_rules! admin_info {
    ($($arg:tt)*) => { $crate::tagged_event!(INFO, $crate::EventTag::AdminInfo, $($arg)*) }
}

#[macro_export]
macro_rules! request_error {
    ($($arg:tt)*) => { $crate::tagged_event!(ERROR, $crate::EventTag::RequestError, $($arg)*) }
}

#[macro_export]
macro_rules! request_warn {
    ($($arg:tt)*) => { $crate::tagged_event!(WARN, $crate::EventTag::RequestWarn, $($arg)*) }
}

#[macro_export]
macro_rules! request_info {
    ($($arg:tt)*) => { $crate::tagged_event!(INFO, $crate::EventTag::RequestInfo, $($arg)*) }
}

#[macro_export]
macro_rules! request_trace {
    ($($arg:tt)*) => { $crate::tagged_event!(TRACE, $crate::EventTag::RequestTrace, $($arg)*) }
}

#[macro_export]
macro_rules! security_critical {
    ($($arg:tt)*) => { $crate::tagged_event!(INFO, $crate::EventTag::SecurityCritical, $($arg)*) }
}

#[macro_export]
macro_rules! security_debug {
    ($($arg:tt)*) => { $crate::tagged_event!(DEBUG, $crate::EventTag::SecurityDebug, $($arg)*) }
}

#[macro_export]
macro_rules! security_error {
    ($($arg:tt)*) => { $crate::tagged_event!(ERROR, $crate::EventTag::SecurityError, $($arg)*) }
}

#[macro_export]
macro_rules! security_info {
    ($($arg:tt)*) => { $crate::tagged_event!(INFO, $crate::EventTag::SecurityInfo, $($arg)*) }
}

#[macro_export]
macro_rules! security_access {
    ($($arg:tt)*) => { $crate::tagged_event!(INFO, $crate::EventTag::SecurityAccess, $($arg)*) }
}

#[macro_export]
macro_rules! flow_error {
    ($($arg:tt)*) => { $crate::tagged_event!(ERROR, $crate::EventTag::FlowError, $($arg)*) }
}

#[macro_export]
macro_rules! flow_warn {
    ($($arg:tt)*) => { $crate::tagged_event!(WARN, $crate::EventTag::FlowWarn, $($arg)*) }
}

#[macro_export]
macro_rules! flow_info {
    ($($arg:tt)*) => { $crate::tagged_event!(INFO, $crate::EventTag::FlowInfo, $($arg)*) }
}

#[macro_export]
macro_rules! flow_trace {
    ($($arg:tt)*) => { $crate::tagged_event!(TRACE, $crate::EventTag::FlowTrace, $($arg)*) }
}

#[macro_export]
macro_rules! source_error {
    ($($arg:tt)*) => { $crate::tagged_event!(ERROR, $crate::EventTag::SourceError, $($arg)*) }
}

#[macro_export]
macro_rules! source_warn {
    ($($arg:tt)*) => { $crate::tagged_event!(WARN, $crate::EventTag::SourceWarn, $($arg)*) }
}

#[macro_export]
macro_rules! source_info {
    ($($arg:tt)*) => { $crate::tagged_event!(INFO, $crate::EventTag::SourceInfo, $($arg)*) }
}
