//! Thin raw-syscall layer. Only the eventfd wrapper survives from the
//! teacher's larger `sys` tree — everything else there backed the epoll
//! selector and pipe-based awakener this crate replaced with
//! `selector::sys` and `sys::eventfd` directly.

pub mod eventfd;
