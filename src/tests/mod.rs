mod support;

mod manager_test;
