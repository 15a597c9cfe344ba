pub mod cam;
